use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AudienceResolver, MessageTemplate, Recipient, TemplateStore};
use crate::campaigns::AudienceSpec;
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug, Clone)]
struct Contact {
    id: Uuid,
    tenant_id: Uuid,
    phone: String,
    attributes: BTreeMap<String, String>,
    tags: Vec<String>,
}

#[derive(Default)]
struct Inner {
    templates: HashMap<Uuid, MessageTemplate>,
    contacts: Vec<Contact>,
}

/// Templates and contacts held in memory; serves both collaborator traits.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, template: MessageTemplate) {
        self.lock().templates.insert(template.id, template);
    }

    /// Stores a contact with its raw phone number. Returns its id.
    pub fn add_contact(
        &self,
        tenant_id: Uuid,
        phone: &str,
        attributes: BTreeMap<String, String>,
        tags: &[&str],
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().contacts.push(Contact {
            id,
            tenant_id,
            phone: phone.to_string(),
            attributes,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        });
        id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TemplateStore for MemoryDirectory {
    fn get_template<'a>(
        &'a self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<MessageTemplate>, InfraError>> {
        boxed(async move {
            Ok(self
                .lock()
                .templates
                .get(&template_id)
                .filter(|t| t.tenant_id == tenant_id)
                .cloned())
        })
    }
}

impl AudienceResolver for MemoryDirectory {
    fn resolve<'a>(
        &'a self,
        tenant_id: Uuid,
        audience: &'a AudienceSpec,
    ) -> BoxFuture<'a, Result<Vec<Recipient>, InfraError>> {
        boxed(async move {
            let inner = self.lock();
            let of_tenant = inner.contacts.iter().filter(|c| c.tenant_id == tenant_id);

            let picked: Vec<&Contact> = match audience {
                AudienceSpec::Tags { tag_ids } => of_tenant
                    .filter(|c| c.tags.iter().any(|t| tag_ids.contains(t)))
                    .collect(),
                AudienceSpec::Recipients { recipient_ids } => recipient_ids
                    .iter()
                    .filter_map(|id| inner.contacts.iter().find(|c| c.id == *id && c.tenant_id == tenant_id))
                    .collect(),
                AudienceSpec::Requeue { .. } => Vec::new(),
            };

            Ok(picked
                .into_iter()
                .map(|c| Recipient {
                    id: c.id,
                    channel_address: c.phone.clone(),
                    attributes: c.attributes.clone(),
                })
                .collect())
        })
    }
}

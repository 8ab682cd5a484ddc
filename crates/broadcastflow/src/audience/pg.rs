use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{
    attribute_text, AudienceResolver, HeaderFormat, MessageTemplate, Recipient, TemplateHeader,
    TemplateStore,
};
use crate::campaigns::AudienceSpec;
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    language: String,
    header_format: Option<String>,
    header_text: Option<String>,
    header_media_url: Option<String>,
    body_text: String,
    approved: bool,
}

impl From<TemplateRow> for MessageTemplate {
    fn from(row: TemplateRow) -> Self {
        let header = row
            .header_format
            .as_deref()
            .and_then(HeaderFormat::parse)
            .map(|format| TemplateHeader {
                format,
                text: row.header_text,
                media_url: row.header_media_url,
            });

        MessageTemplate {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            language: row.language,
            header,
            body: row.body_text,
            approved: row.approved,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ContactRow {
    id: Uuid,
    phone: String,
    attributes: Value,
}

impl From<ContactRow> for Recipient {
    fn from(row: ContactRow) -> Self {
        let attributes: BTreeMap<String, String> = match row.attributes {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), attribute_text(v))).collect(),
            _ => BTreeMap::new(),
        };
        Recipient {
            id: row.id,
            channel_address: row.phone,
            attributes,
        }
    }
}

/// `tenants`, `templates` and `contacts` tables.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn template(
        &self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, InfraError> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, tenant_id, name, language, header_format, header_text,
                   header_media_url, body_text, approved
            FROM templates
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(template_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MessageTemplate::from))
    }

    pub async fn recipients(
        &self,
        tenant_id: Uuid,
        audience: &AudienceSpec,
    ) -> Result<Vec<Recipient>, InfraError> {
        let rows = match audience {
            AudienceSpec::Tags { tag_ids } => {
                sqlx::query_as::<_, ContactRow>(
                    r#"
                    SELECT id, phone, attributes
                    FROM contacts
                    WHERE tenant_id = $1
                      AND tag_ids && $2
                    ORDER BY created_at, id
                    "#,
                )
                .bind(tenant_id)
                .bind(tag_ids)
                .fetch_all(&self.pool)
                .await?
            }
            AudienceSpec::Recipients { recipient_ids } => {
                sqlx::query_as::<_, ContactRow>(
                    r#"
                    SELECT id, phone, attributes
                    FROM contacts
                    WHERE tenant_id = $1
                      AND id = ANY($2)
                    ORDER BY created_at, id
                    "#,
                )
                .bind(tenant_id)
                .bind(recipient_ids)
                .fetch_all(&self.pool)
                .await?
            }
            AudienceSpec::Requeue { .. } => Vec::new(),
        };

        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    // ----------------------------
    // Seeding (operator CLI)
    // ----------------------------

    pub async fn upsert_tenant(
        &self,
        tenant_id: Uuid,
        name: &str,
        messages_per_second: Option<i32>,
    ) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, messages_per_second)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                messages_per_second = EXCLUDED.messages_per_second,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .bind(messages_per_second)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_template(&self, template: &MessageTemplate) -> Result<(), InfraError> {
        let header = template.header.as_ref();
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, tenant_id, name, language, header_format, header_text,
                header_media_url, body_text, approved
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(template.id)
        .bind(template.tenant_id)
        .bind(&template.name)
        .bind(&template.language)
        .bind(header.map(|h| h.format.as_str()))
        .bind(header.and_then(|h| h.text.clone()))
        .bind(header.and_then(|h| h.media_url.clone()))
        .bind(&template.body)
        .bind(template.approved)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_contact(
        &self,
        tenant_id: Uuid,
        phone: &str,
        attributes: Value,
        tag_ids: &[String],
    ) -> Result<Uuid, InfraError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO contacts (id, tenant_id, phone, attributes, tag_ids)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(phone)
        .bind(attributes)
        .bind(tag_ids)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

impl TemplateStore for PgDirectory {
    fn get_template<'a>(
        &'a self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<MessageTemplate>, InfraError>> {
        boxed(self.template(tenant_id, template_id))
    }
}

impl AudienceResolver for PgDirectory {
    fn resolve<'a>(
        &'a self,
        tenant_id: Uuid,
        audience: &'a AudienceSpec,
    ) -> BoxFuture<'a, Result<Vec<Recipient>, InfraError>> {
        boxed(self.recipients(tenant_id, audience))
    }
}

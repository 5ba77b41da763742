//! Reusable model building blocks
//!
//! Models compose these pieces with `#[serde(flatten)]` instead of embedding
//! one another.

use crate::error::DbResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// UUID primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordId {
    pub id: Uuid,
}

impl RecordId {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

/// Creation and update timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Soft delete marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftDelete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Identifier, timestamps and soft delete in one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseModel {
    #[serde(flatten)]
    pub record: RecordId,
    #[serde(flatten)]
    pub timestamps: Timestamps,
    #[serde(flatten)]
    pub soft_delete: SoftDelete,
}

impl BaseModel {
    /// A model with a fresh id, stamped now
    pub fn new() -> Self {
        let mut model = Self::default();
        model.ensure_id();
        model.touch();
        model
    }
}

pub trait Identified {
    fn id(&self) -> Uuid;
    fn set_id(&mut self, id: Uuid);

    /// Assign a random v4 id when the current one is nil
    fn ensure_id(&mut self) -> Uuid {
        if self.id().is_nil() {
            self.set_id(Uuid::new_v4());
        }
        self.id()
    }
}

pub trait Timestamped {
    fn timestamps(&self) -> &Timestamps;
    fn timestamps_mut(&mut self) -> &mut Timestamps;

    /// Set `updated_at` to now; also `created_at` if it was never set
    fn touch(&mut self) {
        let now = Utc::now();
        let ts = self.timestamps_mut();
        if ts.created_at == DateTime::<Utc>::UNIX_EPOCH {
            ts.created_at = now;
        }
        ts.updated_at = now;
    }
}

pub trait SoftDeletable {
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>);

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    fn mark_deleted(&mut self) {
        self.set_deleted_at(Some(Utc::now()));
    }

    fn restore(&mut self) {
        self.set_deleted_at(None);
    }
}

/// Hook run before a model is first inserted
pub trait BeforeCreate {
    fn before_create(&mut self) -> DbResult<()>;
}

impl Identified for RecordId {
    fn id(&self) -> Uuid {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
}

impl BeforeCreate for RecordId {
    fn before_create(&mut self) -> DbResult<()> {
        self.ensure_id();
        Ok(())
    }
}

impl Timestamped for Timestamps {
    fn timestamps(&self) -> &Timestamps {
        self
    }

    fn timestamps_mut(&mut self) -> &mut Timestamps {
        self
    }
}

impl SoftDeletable for SoftDelete {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_at = at;
    }
}

impl Identified for BaseModel {
    fn id(&self) -> Uuid {
        self.record.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.record.id = id;
    }
}

impl Timestamped for BaseModel {
    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    fn timestamps_mut(&mut self) -> &mut Timestamps {
        &mut self.timestamps
    }
}

impl SoftDeletable for BaseModel {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.soft_delete.deleted_at
    }

    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>) {
        self.soft_delete.deleted_at = at;
    }
}

impl BeforeCreate for BaseModel {
    fn before_create(&mut self) -> DbResult<()> {
        self.ensure_id();
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_id_keeps_existing_id() {
        let mut record = RecordId::default();
        let id = record.ensure_id();
        assert!(!id.is_nil());
        assert_eq!(record.ensure_id(), id);
    }

    #[test]
    fn test_before_create_stamps_model() {
        let mut model = BaseModel::default();
        model.before_create().unwrap();
        assert!(!model.id().is_nil());
        assert!(model.timestamps().created_at > DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(model.timestamps().created_at, model.timestamps().updated_at);

        let created = model.timestamps().created_at;
        model.touch();
        assert_eq!(model.timestamps().created_at, created);
        assert!(model.timestamps().updated_at >= created);
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let mut model = BaseModel::new();
        assert!(!model.is_deleted());
        model.mark_deleted();
        assert!(model.is_deleted());
        model.restore();
        assert!(!model.is_deleted());
    }

    #[test]
    fn test_json_shape() {
        let mut model = BaseModel::new();
        let value = serde_json::to_value(model).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("id"));
        assert!(obj.contains_key("createdAt"));
        assert!(obj.contains_key("updatedAt"));
        assert!(!obj.contains_key("deletedAt"));

        model.mark_deleted();
        let value = serde_json::to_value(model).unwrap();
        assert!(value.get("deletedAt").is_some());

        let back: BaseModel = serde_json::from_value(value).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn test_embeds_in_user_models() {
        #[derive(Serialize, Deserialize)]
        struct Patient {
            #[serde(flatten)]
            base: BaseModel,
            name: String,
        }

        let patient = Patient {
            base: BaseModel::new(),
            name: "Ada".into(),
        };
        let value = serde_json::to_value(&patient).unwrap();
        assert_eq!(value["name"], json!("Ada"));
        assert_eq!(value["id"], json!(patient.base.id().to_string()));
    }
}

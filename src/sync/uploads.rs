//! Attachment upload: check the file, store the blob, then add the row
//! optimistically to the card's attachment list.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::models::Attachment;
use crate::errors::UploadError;
use crate::store::blob::{BlobStore, SignedUrl, UploadPolicy};

use super::CollectionHook;

pub struct AttachmentUploader {
    card_id: String,
    blobs: Arc<dyn BlobStore>,
    policy: UploadPolicy,
    attachments: Arc<CollectionHook<Attachment>>,
}

impl AttachmentUploader {
    /// `attachments` should be the hook scoped to `card_id`.
    pub fn new(
        card_id: impl Into<String>,
        blobs: Arc<dyn BlobStore>,
        policy: UploadPolicy,
        attachments: Arc<CollectionHook<Attachment>>,
    ) -> Self {
        Self {
            card_id: card_id.into(),
            blobs,
            policy,
            attachments,
        }
    }

    pub fn attachments(&self) -> &Arc<CollectionHook<Attachment>> {
        &self.attachments
    }

    /// Validate, upload, then record the attachment. Nothing is sent when
    /// the policy rejects the file. If the row cannot be written, the blob
    /// is removed again.
    pub async fn upload(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        declared_type: Option<&str>,
    ) -> Result<Attachment, UploadError> {
        let content_type = self
            .policy
            .check(file_name, declared_type, bytes.len() as u64)?;
        let path = format!(
            "cards/{}/{}-{}",
            self.card_id,
            uuid::Uuid::new_v4(),
            file_name
        );
        let stored = self.blobs.upload(&path, bytes, &content_type).await?;

        let attachment = Attachment {
            id: String::new(),
            card_id: self.card_id.clone(),
            file_name: file_name.to_string(),
            storage_path: stored.path.clone(),
            content_type: stored.content_type,
            size_bytes: stored.size,
            uploaded_by: None,
            created_at: None,
        };
        match self.attachments.create(attachment).await {
            Ok(created) => {
                tracing::info!(card_id = %self.card_id, path = %stored.path, "attachment uploaded");
                Ok(created)
            }
            Err(err) => {
                if let Err(cleanup) = self.blobs.remove(&stored.path).await {
                    tracing::warn!(path = %stored.path, error = %cleanup, "orphaned blob left behind");
                }
                Err(err.into())
            }
        }
    }

    /// Time-limited download link for `attachment`.
    pub fn signed_url(&self, attachment: &Attachment, ttl: Duration) -> Result<SignedUrl, UploadError> {
        self.blobs.signed_url(&attachment.storage_path, ttl)
    }

    /// Delete the attachment row, then its blob.
    pub async fn remove(&self, id: &str) -> Result<(), UploadError> {
        let attachment = self.attachments.get(id);
        self.attachments.delete(id).await?;
        if let Some(attachment) = attachment {
            self.blobs.remove(&attachment.storage_path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StoreError, SyncError};
    use crate::store::blob::FsBlobStore;
    use crate::store::mock::MockStore;
    use crate::sync::{Actor, HookOptions, SyncContext};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MockStore>,
        blobs: Arc<FsBlobStore>,
        uploader: AttachmentUploader,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "secret"));
        let ctx = SyncContext::new(Actor {
            user_id: "u1".into(),
            display_name: "Ana".into(),
        });
        let hook = CollectionHook::mount_for(
            store.clone(),
            "card_id",
            Some("c1"),
            ctx,
            HookOptions::default(),
        )
        .await;
        let uploader = AttachmentUploader::new(
            "c1",
            blobs.clone(),
            UploadPolicy {
                allowed_types: vec!["application/pdf".into(), "image/*".into()],
                max_bytes: 1024,
            },
            hook,
        );
        Fixture {
            _dir: dir,
            store,
            blobs,
            uploader,
        }
    }

    #[tokio::test]
    async fn test_upload_stores_blob_and_row() {
        let f = fixture().await;

        let attachment = f
            .uploader
            .upload("rg.pdf", b"%PDF".to_vec(), None)
            .await
            .unwrap();

        assert!(attachment.storage_path.starts_with("cards/c1/"));
        assert!(attachment.storage_path.ends_with("-rg.pdf"));
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.size_bytes, 4);
        assert_eq!(attachment.uploaded_by.as_deref(), Some("u1"));
        assert_eq!(f.blobs.read(&attachment.storage_path).await.unwrap(), b"%PDF");
        assert_eq!(f.uploader.attachments().items(), vec![attachment]);
        assert_eq!(f.store.rows("attachments").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_file_never_reaches_the_store() {
        let f = fixture().await;

        let too_big = f.uploader.upload("big.pdf", vec![0; 2048], None).await;
        let wrong_type = f.uploader.upload("notes.txt", b"hi".to_vec(), None).await;

        assert!(matches!(too_big, Err(UploadError::TooLarge { .. })));
        assert!(matches!(wrong_type, Err(UploadError::TypeNotAllowed { .. })));
        assert_eq!(f.store.write_count(), 0);
        assert!(!f.blobs.root().join("cards").exists());
    }

    #[tokio::test]
    async fn test_failed_row_write_removes_blob() {
        let f = fixture().await;
        f.store.fail_next_write(StoreError::new("500", "down"));

        let err = f
            .uploader
            .upload("scan.png", b"png".to_vec(), Some("image/png"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Sync(SyncError::Remote(_))));
        assert!(f.uploader.attachments().items().is_empty());
        let dir = f.blobs.root().join("cards/c1");
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_signed_url_and_remove() {
        let f = fixture().await;
        let attachment = f
            .uploader
            .upload("rg.pdf", b"%PDF".to_vec(), None)
            .await
            .unwrap();

        let url = f
            .uploader
            .signed_url(&attachment, Duration::from_secs(300))
            .unwrap();
        f.blobs
            .verify(&url.path, url.expires, &url.signature, Utc::now())
            .unwrap();

        f.uploader.remove(&attachment.id).await.unwrap();
        assert!(f.uploader.attachments().items().is_empty());
        assert!(f.blobs.read(&attachment.storage_path).await.is_err());
    }
}

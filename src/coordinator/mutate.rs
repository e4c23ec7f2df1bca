//! Mutation path: update, create, delete, upsert, replace.
//!
//! Each operation follows the same shape (spec §4.7): acquire the key's
//! mutex, apply an optimistic local write, make the conditional remote
//! call if a client is configured, reconcile the response back into the
//! source of truth, then update bookkeeping. None of these throw except
//! for cancellation and programmer errors — every failure path returns a
//! `Failed` variant (spec §9: "no rollback on mutation failure").

use std::sync::Arc;

use chrono::Utc;

use crate::converter::Converter;
use crate::error::EngineError;
use crate::fetcher::Fetcher;
use crate::mutation::{MutationClient, MutationEncoder, MutationResponse, Precondition};
use crate::results::{CreateResult, DeleteResult, ReplaceResult, UpdateResult, UpsertResult};
use crate::source_of_truth::{RekeyReconcile, SourceOfTruth};

use crate::engine::Engine;

impl<S, F, C, Enc, M> Engine<S, F, C, Enc, M>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net> + 'static,
    M: MutationClient<Key = S::Key, Net = F::Net> + 'static,
{
    /// Apply a mutation client's success echo (if any) to the source of
    /// truth under a transaction, then record bookkeeping success.
    async fn apply_echo(&self, key: &S::Key, echo: Option<F::Net>, etag: Option<String>) -> Result<(), EngineError> {
        if let Some(net) = echo {
            let write = self.converter.net_to_write(key, &net);
            let sot = Arc::clone(&self.sot);
            let key2 = key.clone();
            self.sot
                .with_transaction(Box::new(move || Box::pin(async move { sot.write(&key2, write).await })))
                .await?;
        }
        self.bookkeeper.record_success(key, etag, Utc::now()).await;
        Ok(())
    }

    async fn precondition(&self, key: &S::Key) -> Precondition {
        Precondition {
            if_match: self.bookkeeper.status(key).await.last_etag,
        }
    }

    /// Apply a partial update. `patch` is handed to the mutation encoder
    /// for the wire payload; `patch_fn`, if given, is the "local patch
    /// function" (spec §4.7) applied to a best-effort `base` read from the
    /// source of truth to derive the optimistic local write. With no
    /// `patch_fn`, the update has no local preview and only the remote
    /// leg below runs.
    pub async fn update(
        &self,
        key: S::Key,
        patch: Enc::Patch,
        patch_fn: Option<Box<dyn FnOnce(Option<C::Domain>) -> C::Domain + Send>>,
        require_online: bool,
    ) -> UpdateResult {
        if let Err(cause) = self.ensure_open() {
            return UpdateResult::Failed { cause };
        }
        let _guard = self.key_mutex.lock(&key).await;

        // Spec §4.7 step 1: best-effort base, null on any failure.
        let base = self
            .sot
            .peek(&key)
            .await
            .ok()
            .flatten()
            .map(|read| self.converter.read_to_domain(&key, &read));

        if let Some(patch_fn) = patch_fn {
            let next_domain = patch_fn(base);
            if let Some(write) = self.converter.domain_to_write(&key, &next_domain) {
                if let Err(cause) = self.sot.write(&key, write).await {
                    return UpdateResult::Failed { cause };
                }
            }
        }

        let client = match &self.mutation_client {
            Some(client) => client,
            None => {
                return if require_online {
                    UpdateResult::Failed { cause: EngineError::NoClient }
                } else {
                    UpdateResult::Enqueued
                };
            }
        };

        let net = match self.encoder.encode_patch(&key, &patch) {
            Some(net) => net,
            None => return UpdateResult::Failed { cause: EngineError::EncodingUnsupported },
        };

        let pre = self.precondition(&key).await;
        match client.patch(&key, net, pre).await {
            Ok(MutationResponse::Success { echo, etag }) => match self.apply_echo(&key, echo, etag).await {
                Ok(()) => UpdateResult::Synced,
                Err(cause) => UpdateResult::Failed { cause },
            },
            Ok(MutationResponse::Conflict { server_etag }) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                UpdateResult::Failed { cause: EngineError::Conflict { server_etag } }
            }
            Ok(MutationResponse::Failure(cause)) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                UpdateResult::Failed { cause: EngineError::Cause(cause) }
            }
            Err(cause) => UpdateResult::Failed { cause },
        }
    }

    /// Create a record under a caller-supplied provisional key. If the
    /// server assigns a different canonical key, the source of truth is
    /// rekeyed (spec §4.7: "Create(draft, policy)").
    pub async fn create(&self, provisional_key: S::Key, draft: C::Domain) -> CreateResult<S::Key> {
        if let Err(cause) = self.ensure_open() {
            return CreateResult::Failed { provisional: Some(provisional_key), cause };
        }
        let _guard = self.key_mutex.lock(&provisional_key).await;

        if let Some(write) = self.converter.domain_to_write(&provisional_key, &draft) {
            if let Err(cause) = self.sot.write(&provisional_key, write).await {
                return CreateResult::Failed { provisional: Some(provisional_key), cause };
            }
        }

        let client = match &self.mutation_client {
            Some(client) => client,
            None => {
                return CreateResult::Failed {
                    provisional: Some(provisional_key),
                    cause: EngineError::NoClient,
                }
            }
        };

        let net = match self.encoder.encode_create(&draft) {
            Some(net) => net,
            None => {
                return CreateResult::Failed {
                    provisional: Some(provisional_key),
                    cause: EngineError::EncodingUnsupported,
                }
            }
        };

        match client.post(&provisional_key, net).await {
            Ok((canonical_key, MutationResponse::Success { echo, etag })) => {
                if canonical_key == provisional_key {
                    if let Err(cause) = self.apply_echo(&canonical_key, echo, etag).await {
                        return CreateResult::Failed { provisional: Some(provisional_key), cause };
                    }
                } else {
                    let converter = Arc::clone(&self.converter);
                    let fallback_write = self.converter.domain_to_write(&canonical_key, &draft);
                    let canonical_for_closure = canonical_key.clone();
                    let reconcile: RekeyReconcile<S::Read, S::Write> = Box::new(move |_existing| {
                        echo.map(|net| converter.net_to_write(&canonical_for_closure, &net))
                            .or(fallback_write)
                    });
                    if let Err(cause) = self.sot.rekey(&provisional_key, &canonical_key, reconcile).await {
                        return CreateResult::Failed { provisional: Some(provisional_key), cause };
                    }
                    self.bookkeeper.record_success(&canonical_key, etag, Utc::now()).await;
                }
                CreateResult::Synced {
                    canonical_key,
                    provisional: Some(provisional_key),
                }
            }
            Ok((_, MutationResponse::Conflict { server_etag })) => {
                self.bookkeeper.record_failure(&provisional_key, Utc::now()).await;
                CreateResult::Failed {
                    provisional: Some(provisional_key),
                    cause: EngineError::Conflict { server_etag },
                }
            }
            Ok((_, MutationResponse::Failure(cause))) => {
                self.bookkeeper.record_failure(&provisional_key, Utc::now()).await;
                CreateResult::Failed {
                    provisional: Some(provisional_key),
                    cause: EngineError::Cause(cause),
                }
            }
            Err(cause) => CreateResult::Failed { provisional: Some(provisional_key), cause },
        }
    }

    /// Delete a record. There is no generic way to reconstruct a
    /// `WriteEntity` from whatever was deleted, so a failed remote
    /// deletion is never rolled back locally (spec §9): `restored` is
    /// always `false`.
    pub async fn delete(&self, key: S::Key, require_online: bool) -> DeleteResult {
        if let Err(cause) = self.ensure_open() {
            return DeleteResult::Failed { cause, restored: false };
        }
        let _guard = self.key_mutex.lock(&key).await;

        let was_present = matches!(self.sot.peek(&key).await, Ok(Some(_)));

        if let Err(cause) = self.sot.delete(&key).await {
            return DeleteResult::Failed { cause, restored: false };
        }

        let client = match &self.mutation_client {
            Some(client) => client,
            None => {
                return if require_online {
                    DeleteResult::Failed { cause: EngineError::NoClient, restored: false }
                } else {
                    DeleteResult::Enqueued
                };
            }
        };

        let pre = self.precondition(&key).await;
        match client.delete(&key, pre).await {
            Ok(MutationResponse::Success { etag, .. }) => {
                self.bookkeeper.record_success(&key, etag, Utc::now()).await;
                DeleteResult::Synced { already_deleted: !was_present }
            }
            Ok(MutationResponse::Conflict { server_etag }) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                DeleteResult::Failed { cause: EngineError::Conflict { server_etag }, restored: false }
            }
            Ok(MutationResponse::Failure(cause)) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                DeleteResult::Failed { cause: EngineError::Cause(cause), restored: false }
            }
            Err(cause) => DeleteResult::Failed { cause, restored: false },
        }
    }

    /// Create-or-update. If `require_online` is `false` and no mutation
    /// client is configured, the optimistic local write stands and
    /// `UpsertResult::Local` is returned without scheduling further work
    /// (spec §9 open-question decision).
    pub async fn upsert(&self, key: S::Key, value: C::Domain, require_online: bool) -> UpsertResult<S::Key> {
        if let Err(cause) = self.ensure_open() {
            return UpsertResult::Failed { key, cause };
        }
        let _guard = self.key_mutex.lock(&key).await;

        let existed = matches!(self.sot.peek(&key).await, Ok(Some(_)));

        if let Some(write) = self.converter.domain_to_write(&key, &value) {
            if let Err(cause) = self.sot.write(&key, write).await {
                return UpsertResult::Failed { key, cause };
            }
        }

        let client = match &self.mutation_client {
            Some(client) => client,
            None => {
                return if require_online {
                    UpsertResult::Failed { key, cause: EngineError::NoClient }
                } else {
                    UpsertResult::Local { key }
                };
            }
        };

        let net = match self.encoder.encode_upsert(&key, &value) {
            Some(net) => net,
            None => return UpsertResult::Failed { key, cause: EngineError::EncodingUnsupported },
        };

        let pre = self.precondition(&key).await;
        match client.put(&key, net, pre).await {
            Ok(MutationResponse::Success { echo, etag }) => match self.apply_echo(&key, echo, etag).await {
                Ok(()) => UpsertResult::Synced { key, created: !existed },
                Err(cause) => UpsertResult::Failed { key, cause },
            },
            Ok(MutationResponse::Conflict { server_etag }) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                UpsertResult::Failed { key, cause: EngineError::Conflict { server_etag } }
            }
            Ok(MutationResponse::Failure(cause)) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                UpsertResult::Failed { key, cause: EngineError::Cause(cause) }
            }
            Err(cause) => UpsertResult::Failed { key, cause },
        }
    }

    /// Replace a record's full value.
    pub async fn replace(&self, key: S::Key, value: C::Domain, require_online: bool) -> ReplaceResult {
        if let Err(cause) = self.ensure_open() {
            return ReplaceResult::Failed { cause };
        }
        let _guard = self.key_mutex.lock(&key).await;

        if let Some(write) = self.converter.domain_to_write(&key, &value) {
            if let Err(cause) = self.sot.write(&key, write).await {
                return ReplaceResult::Failed { cause };
            }
        }

        let client = match &self.mutation_client {
            Some(client) => client,
            None => {
                return if require_online {
                    ReplaceResult::Failed { cause: EngineError::NoClient }
                } else {
                    ReplaceResult::Enqueued
                };
            }
        };

        let net = match self.encoder.encode_replace(&key, &value) {
            Some(net) => net,
            None => return ReplaceResult::Failed { cause: EngineError::EncodingUnsupported },
        };

        let pre = self.precondition(&key).await;
        match client.put(&key, net, pre).await {
            Ok(MutationResponse::Success { echo, etag }) => match self.apply_echo(&key, echo, etag).await {
                Ok(()) => ReplaceResult::Synced,
                Err(cause) => ReplaceResult::Failed { cause },
            },
            Ok(MutationResponse::Conflict { server_etag }) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                ReplaceResult::Failed { cause: EngineError::Conflict { server_etag } }
            }
            Ok(MutationResponse::Failure(cause)) => {
                self.bookkeeper.record_failure(&key, Utc::now()).await;
                ReplaceResult::Failed { cause: EngineError::Cause(cause) }
            }
            Err(cause) => ReplaceResult::Failed { cause },
        }
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use std::time::Duration;

    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::error::CauseError;
    use crate::key::Key;
    use crate::results::{CreateResult, DeleteResult, UpdateResult, UpsertResult};
    use crate::source_of_truth::SourceOfTruth;
    use crate::testing::{
        IdentityConverter, IdentityEncoder, InMemorySourceOfTruth, ScriptedFetcher, ScriptedMutationClient,
    };

    type TestEngine = Engine<
        InMemorySourceOfTruth<Key, String, String>,
        ScriptedFetcher<Key, String>,
        IdentityConverter<Key, String>,
        IdentityEncoder<Key, String>,
        ScriptedMutationClient<Key, String>,
    >;

    fn build_with_client() -> TestEngine {
        Engine::builder(
            InMemorySourceOfTruth::identity(),
            ScriptedFetcher::new(Duration::ZERO),
            IdentityConverter::default(),
            IdentityEncoder::default(),
        )
        .with_config(EngineConfig::default().with_memory_ttl(Duration::from_secs(60)))
        .with_mutation_client(ScriptedMutationClient::new())
        .build()
        .unwrap()
    }

    fn build_without_client() -> TestEngine {
        Engine::builder(
            InMemorySourceOfTruth::identity(),
            ScriptedFetcher::new(Duration::ZERO),
            IdentityConverter::default(),
            IdentityEncoder::default(),
        )
        .with_config(EngineConfig::default().with_memory_ttl(Duration::from_secs(60)))
        .build()
        .unwrap()
    }

    /// Scenario 4: optimistic update with echo reconciles into the source
    /// of truth and reports `Synced`.
    #[tokio::test]
    async fn update_with_echo_reconciles_and_reports_synced() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "A".to_string()).await.unwrap();

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Success {
                echo: Some("B".to_string()),
                etag: Some("v2".to_string()),
            }),
        );

        let result = engine
            .update(key.clone(), "B".to_string(), Some(Box::new(|_base| "B".to_string())), false)
            .await;
        assert!(matches!(result, UpdateResult::Synced));

        assert_eq!(engine.sot.peek(&key).await.unwrap(), Some("B".to_string()));
        let status = engine.bookkeeper.status(&key).await;
        assert_eq!(status.last_etag.as_deref(), Some("v2"));
    }

    /// Scenario 5: update conflict surfaces `Failed{conflict}` and records
    /// a bookkeeper failure, with no automatic rollback of the optimistic
    /// local write (spec §9).
    #[tokio::test]
    async fn update_conflict_reports_failed_and_keeps_optimistic_write() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "A".to_string()).await.unwrap();

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Conflict {
                server_etag: Some("v2".to_string()),
            }),
        );

        let result = engine
            .update(key.clone(), "B".to_string(), Some(Box::new(|_base| "B".to_string())), false)
            .await;
        match result {
            UpdateResult::Failed { cause } => assert!(cause.is_conflict()),
            other => panic!("expected Failed{{conflict}}, got {other:?}"),
        }

        // Optimistic local write stands; no rollback.
        assert_eq!(engine.sot.peek(&key).await.unwrap(), Some("B".to_string()));
        let status = engine.bookkeeper.status(&key).await;
        assert!(status.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn update_without_client_and_not_require_online_is_enqueued() {
        let engine = build_without_client();
        let key = Key::by_id("users", "User", "1");
        let result = engine
            .update(key, "B".to_string(), Some(Box::new(|_base| "B".to_string())), false)
            .await;
        assert!(matches!(result, UpdateResult::Enqueued));
    }

    #[tokio::test]
    async fn update_without_client_and_require_online_fails() {
        let engine = build_without_client();
        let key = Key::by_id("users", "User", "1");
        let result = engine
            .update(key, "B".to_string(), Some(Box::new(|_base| "B".to_string())), true)
            .await;
        assert!(matches!(result, UpdateResult::Failed { cause: crate::error::EngineError::NoClient }));
    }

    /// `update` with no `patch_fn` derives `base` internally (spec §4.7
    /// step 1) but applies no optimistic local write; the prior value
    /// stands until the remote echo reconciles it.
    #[tokio::test]
    async fn update_without_patch_fn_reads_base_but_skips_optimistic_write() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "A".to_string()).await.unwrap();

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Success {
                echo: Some("B".to_string()),
                etag: Some("v2".to_string()),
            }),
        );

        let result = engine.update(key.clone(), "B".to_string(), None, false).await;
        assert!(matches!(result, UpdateResult::Synced));
        // No optimistic write happened, only the echo's reconciliation.
        assert_eq!(engine.sot.peek(&key).await.unwrap(), Some("B".to_string()));
    }

    /// `create` rekeys the source of truth when the server assigns a
    /// canonical key different from the caller's provisional one.
    #[tokio::test]
    async fn create_rekeys_when_server_assigns_a_different_canonical_key() {
        let engine = build_with_client();
        let provisional = Key::by_id("users", "User", "tmp-1");
        let canonical = Key::by_id("users", "User", "42");

        engine.mutation_client.as_ref().unwrap().push_create_response(
            provisional.clone(),
            Ok((
                canonical.clone(),
                crate::mutation::MutationResponse::Success {
                    echo: Some("created".to_string()),
                    etag: Some("v1".to_string()),
                },
            )),
        );

        let result = engine.create(provisional.clone(), "draft".to_string()).await;
        match result {
            CreateResult::Synced { canonical_key, provisional: p } => {
                assert_eq!(canonical_key, canonical);
                assert_eq!(p, Some(provisional.clone()));
            }
            other => panic!("expected Synced, got {other:?}"),
        }

        assert_eq!(engine.sot.peek(&canonical).await.unwrap(), Some("created".to_string()));
        assert_eq!(engine.sot.peek(&provisional).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_without_client_fails() {
        let engine = build_without_client();
        let provisional = Key::by_id("users", "User", "tmp-1");
        let result = engine.create(provisional.clone(), "draft".to_string()).await;
        assert!(matches!(result, CreateResult::Failed { cause: crate::error::EngineError::NoClient, .. }));
    }

    /// `delete` applies the optimistic local delete before the remote call
    /// and reports whether the server considered it already gone.
    #[tokio::test]
    async fn delete_reports_synced_and_already_deleted() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "A".to_string()).await.unwrap();

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Success { echo: None, etag: None }),
        );

        let result = engine.delete(key.clone(), false).await;
        assert!(matches!(result, DeleteResult::Synced { already_deleted: false }));
        assert_eq!(engine.sot.peek(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_without_client_and_not_require_online_is_enqueued() {
        let engine = build_without_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "A".to_string()).await.unwrap();
        let result = engine.delete(key, false).await;
        assert!(matches!(result, DeleteResult::Enqueued));
    }

    /// `upsert` distinguishes created vs replaced based on whether the key
    /// already existed in the source of truth.
    #[tokio::test]
    async fn upsert_reports_created_when_key_did_not_exist() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Success {
                echo: Some("new".to_string()),
                etag: Some("v1".to_string()),
            }),
        );

        let result = engine.upsert(key.clone(), "new".to_string(), false).await;
        match result {
            UpsertResult::Synced { created, .. } => assert!(created),
            other => panic!("expected Synced{{created: true}}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_reports_replaced_when_key_already_existed() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.sot.write(&key, "old".to_string()).await.unwrap();

        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Success {
                echo: Some("new".to_string()),
                etag: Some("v2".to_string()),
            }),
        );

        let result = engine.upsert(key.clone(), "new".to_string(), false).await;
        match result {
            UpsertResult::Synced { created, .. } => assert!(!created),
            other => panic!("expected Synced{{created: false}}, got {other:?}"),
        }
    }

    /// Open-question resolution (spec §9): `upsert` with no client and
    /// `requireOnline = false` reports `Local` and stops there.
    #[tokio::test]
    async fn upsert_without_client_and_not_require_online_is_local() {
        let engine = build_without_client();
        let key = Key::by_id("users", "User", "1");
        let result = engine.upsert(key.clone(), "new".to_string(), false).await;
        assert!(matches!(result, UpsertResult::Local { .. }));
        assert_eq!(engine.sot.peek(&key).await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn replace_without_client_and_require_online_fails() {
        let engine = build_without_client();
        let key = Key::by_id("users", "User", "1");
        let result = engine.replace(key, "new".to_string(), true).await;
        assert!(matches!(result, crate::results::ReplaceResult::Failed { cause: crate::error::EngineError::NoClient }));
    }

    #[tokio::test]
    async fn mutation_failure_records_bookkeeper_failure() {
        let engine = build_with_client();
        let key = Key::by_id("users", "User", "1");
        engine.mutation_client.as_ref().unwrap().push_response(
            key.clone(),
            Ok(crate::mutation::MutationResponse::Failure(CauseError::msg("server error"))),
        );

        let result = engine.replace(key.clone(), "new".to_string(), false).await;
        assert!(matches!(result, crate::results::ReplaceResult::Failed { .. }));
        let status = engine.bookkeeper.status(&key).await;
        assert!(status.last_failure_at.is_some());
    }
}

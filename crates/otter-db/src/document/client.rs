//! MongoDB client wrapper

use super::{DocumentConfig, ReadPreferenceMode};
use crate::context::Context;
use crate::error::{BoxError, DbError, DbResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use mongodb::bson::doc;
use mongodb::error::{TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria};
use mongodb::{Client, ClientSession, Collection, Database};
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// Connected document store client bound to one database
#[derive(Clone)]
pub struct DocumentClient {
    client: Client,
    config: DocumentConfig,
    selection: SelectionCriteria,
}

fn read_preference(mode: ReadPreferenceMode) -> ReadPreference {
    match mode {
        ReadPreferenceMode::Primary => ReadPreference::Primary,
        ReadPreferenceMode::Secondary => ReadPreference::Secondary {
            options: Default::default(),
        },
        ReadPreferenceMode::PrimaryPreferred => ReadPreference::PrimaryPreferred {
            options: Default::default(),
        },
        ReadPreferenceMode::SecondaryPreferred => ReadPreference::SecondaryPreferred {
            options: Default::default(),
        },
        ReadPreferenceMode::Nearest => ReadPreference::Nearest {
            options: Default::default(),
        },
    }
}

impl DocumentClient {
    /// Validate `config`, connect and ping within the configured timeout.
    /// The client is shut down again when the ping fails.
    pub async fn connect(config: DocumentConfig) -> DbResult<Self> {
        config.validate()?;
        let config = config.with_defaults();
        let mode = config.read_preference_mode().map_err(|e| {
            DbError::configuration(format!("failed to set read preference: {}", e))
        })?;
        let selection = SelectionCriteria::ReadPreference(read_preference(mode));

        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| DbError::configuration(format!("invalid configuration: {}", e)))?;
        options.max_pool_size = Some(config.max_pool_size);
        options.min_pool_size = Some(config.min_pool_size);
        options.max_idle_time = Some(config.max_idle_time);
        options.max_connecting = Some(config.max_connecting);
        options.connect_timeout = Some(config.timeout());
        options.server_selection_timeout = Some(config.timeout());
        options.selection_criteria = Some(selection.clone());
        options.retry_writes = Some(config.retry_writes);
        options.retry_reads = Some(config.retry_reads);

        let client = Client::with_options(options)
            .map_err(|e| DbError::Connection(format!("failed to connect to MongoDB: {}", e)))?;

        let document = Self {
            client,
            config,
            selection,
        };

        let ctx = Context::background().with_timeout(document.config.timeout());
        if let Err(err) = document.ping(&ctx).await {
            document.disconnect().await;
            return Err(DbError::Connection(format!(
                "failed to ping MongoDB: {}",
                err
            )));
        }

        tracing::info!(
            database = %document.config.database,
            read_preference = %mode,
            "document store connected"
        );

        Ok(document)
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        let db = self.database();
        let selection = self.selection.clone();
        ctx.run(async move {
            db.run_command(doc! { "ping": 1 }, selection).await?;
            Ok(())
        })
        .await
    }

    pub async fn is_healthy(&self, ctx: &Context) -> bool {
        self.ping(ctx).await.is_ok()
    }

    /// The configured database
    pub fn database(&self) -> Database {
        self.client.database(&self.config.database)
    }

    pub fn collection<T>(&self, name: &str) -> Collection<T> {
        self.database().collection(name)
    }

    /// Close pooled connections and stop background monitoring
    pub async fn disconnect(&self) {
        self.client.clone().shutdown().await;
        tracing::debug!(database = %self.config.database, "document store disconnected");
    }

    /// Run `work` inside a session transaction. Commits when it succeeds and
    /// aborts when it fails or panics; panics resume after the abort.
    ///
    /// Like the driver's convenient transaction API, `work` is run again when
    /// it fails with a `TransientTransactionError`, and the commit is retried
    /// when its outcome is unknown. Retries stop once `ctx` is done or
    /// [`TRANSACTION_RETRY_WINDOW`] has passed.
    pub async fn with_transaction<F>(&self, ctx: &Context, mut work: F) -> DbResult<()>
    where
        F: for<'s> FnMut(&'s mut ClientSession) -> BoxFuture<'s, Result<(), BoxError>>,
    {
        let client = self.client.clone();
        let mut session = ctx
            .run(async move { Ok(client.start_session(None).await?) })
            .await
            .map_err(|e| DbError::transaction("failed to start session", e))?;
        let started = Instant::now();

        'attempt: loop {
            ctx.run(async { Ok(session.start_transaction(None).await?) })
                .await
                .map_err(|e| DbError::transaction("failed to start transaction", e))?;

            let outcome = AssertUnwindSafe(work(&mut session)).catch_unwind().await;

            let err = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(payload) => {
                    if let Err(abort_err) = abort(&mut session).await {
                        tracing::warn!(error = %abort_err, "abort after panic failed");
                    }
                    std::panic::resume_unwind(payload)
                }
            };

            if let Some(err) = err {
                if let Err(abort_err) = abort(&mut session).await {
                    return Err(DbError::Rollback {
                        context: "transaction failed",
                        cleanup: "abort",
                        source: err,
                        rollback: Box::new(abort_err),
                    });
                }
                if has_label(&*err, TRANSIENT_TRANSACTION_ERROR) && may_retry(ctx, started) {
                    tracing::debug!(error = %err, "retrying transient transaction failure");
                    continue 'attempt;
                }
                return Err(DbError::transaction("transaction failed", err));
            }

            if let Some(err) = ctx.err() {
                if let Err(abort_err) = abort(&mut session).await {
                    tracing::warn!(error = %abort_err, "abort of abandoned transaction failed");
                }
                return Err(err);
            }

            loop {
                let committed = ctx
                    .run(async { Ok(session.commit_transaction().await) })
                    .await
                    .map_err(|e| DbError::Commit(Box::new(e)))?;
                let Err(err) = committed else {
                    return Ok(());
                };
                if may_retry(ctx, started) {
                    if err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
                        tracing::debug!(error = %err, "retrying commit with unknown result");
                        continue;
                    }
                    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                        tracing::debug!(error = %err, "retrying transaction after transient commit failure");
                        continue 'attempt;
                    }
                }
                return Err(DbError::Commit(Box::new(err.into())));
            }
        }
    }
}

/// Upper bound on the time spent retrying one transaction
pub const TRANSACTION_RETRY_WINDOW: Duration = Duration::from_secs(120);

async fn abort(session: &mut ClientSession) -> DbResult<()> {
    Context::cleanup()
        .run(async { Ok(session.abort_transaction().await?) })
        .await
}

fn may_retry(ctx: &Context, started: Instant) -> bool {
    ctx.err().is_none() && started.elapsed() < TRANSACTION_RETRY_WINDOW
}

/// Whether `err`, or an error it wraps, is a driver error carrying `label`
fn has_label(err: &(dyn std::error::Error + 'static), label: &str) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(driver) = err.downcast_ref::<mongodb::error::Error>() {
            if driver.contains_label(label) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

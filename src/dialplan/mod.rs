//! Dialplan Evaluator — user-authored routing script, hot-recompiled
//!
//! The original's runtime-compiled C# dialplan is replaced by an
//! embedded `rhai` script. The compiled AST lives behind a single
//! `ArcSwap` slot: recompilation publishes a new pointer, and
//! in-flight evaluations keep using the pointer they captured —
//! exactly the atomic-slot shape the concurrency model calls for.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rhai::{Engine, Scope, AST};
use tracing::{error, info};

use crate::store::{Dialplan as DialplanRecord, Store};
use crate::Result;

/// A destination returned from the script, the Rust-side mirror of
/// `new fwd(dest, body)`.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub destination_uri: String,
    pub body: Option<String>,
}

struct CompiledDialplan {
    ast: AST,
    compiled_at: DateTime<Utc>,
    source_last_update: DateTime<Utc>,
    compile_error: Option<String>,
}

pub struct DialplanEvaluator {
    engine: Engine,
    store: Arc<dyn Store>,
    name: String,
    max_operations: u64,
    slot: ArcSwap<CompiledDialplan>,
}

impl DialplanEvaluator {
    pub async fn load(
        store: Arc<dyn Store>,
        name: &str,
        max_operations: u64,
        max_call_levels: usize,
    ) -> Result<Self> {
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);
        engine.set_max_call_levels(max_call_levels);
        register_fwd_type(&mut engine);

        let record = store
            .load_dialplan(name)
            .await?
            .unwrap_or_else(|| DialplanRecord {
                name: name.to_string(),
                script_source: default_script().to_string(),
                last_update: Utc::now(),
            });

        let (ast, compile_error) = compile(&engine, &record.script_source);
        let compiled = CompiledDialplan {
            ast: ast.unwrap_or_else(|| engine.compile("").expect("empty script compiles")),
            compiled_at: Utc::now(),
            source_last_update: truncate_seconds(record.last_update),
            compile_error,
        };

        Ok(Self {
            engine,
            store,
            name: name.to_string(),
            max_operations,
            slot: ArcSwap::from_pointee(compiled),
        })
    }

    /// Recompiles if the persisted `lastUpdate` (truncated to whole
    /// seconds) is newer than the currently-compiled version, then
    /// evaluates `lookup(dialledUser, fromAccountId)` synchronously.
    pub async fn lookup(
        &self,
        dialled_user: &str,
        from_account_id: Option<String>,
    ) -> Option<CallDescriptor> {
        self.recompile_if_stale().await;

        let compiled = self.slot.load();
        let mut scope = Scope::new();
        let args = (dialled_user.to_string(), from_account_id.unwrap_or_default());

        let result: std::result::Result<FwdDescriptor, _> =
            self.engine
                .call_fn(&mut scope, &compiled.ast, "lookup", args);

        match result {
            Ok(descriptor) => Some(CallDescriptor {
                destination_uri: descriptor.destination,
                body: if descriptor.body.is_empty() {
                    None
                } else {
                    Some(descriptor.body)
                },
            }),
            Err(e) => {
                error!(error = %e, "dialplan script returned no route or raised an error");
                None
            }
        }
    }

    async fn recompile_if_stale(&self) {
        let record = match self.store.load_dialplan(&self.name).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        let source_last_update = truncate_seconds(record.last_update);
        if source_last_update <= self.slot.load().source_last_update {
            return;
        }

        let (ast, compile_error) = compile(&self.engine, &record.script_source);
        match ast {
            Some(ast) => {
                info!(name = %self.name, "dialplan recompiled");
                self.slot.store(Arc::new(CompiledDialplan {
                    ast,
                    compiled_at: Utc::now(),
                    source_last_update,
                    compile_error,
                }));
            }
            None => {
                error!(error = ?compile_error, "dialplan compile failed, keeping previous version");
            }
        }
    }

    pub fn last_compile_error(&self) -> Option<String> {
        self.slot.load().compile_error.clone()
    }
}

#[derive(Debug, Clone, Default)]
struct FwdDescriptor {
    destination: String,
    body: String,
}

fn register_fwd_type(engine: &mut Engine) {
    engine
        .register_type_with_name::<FwdDescriptor>("fwd")
        .register_fn("fwd", |destination: String, body: String| FwdDescriptor {
            destination,
            body,
        })
        .register_fn("fwd", |destination: String| FwdDescriptor {
            destination,
            body: String::new(),
        });
}

fn compile(engine: &Engine, source: &str) -> (Option<AST>, Option<String>) {
    match engine.compile(source) {
        Ok(ast) => (Some(ast), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

fn truncate_seconds(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp)
}

/// Seeded default: routes everything to an echo extension so a fresh
/// deployment has a working dialplan before an operator configures one.
fn default_script() -> &'static str {
    r#"
        fn lookup(dialled_user, from_account) {
            fwd(dialled_user + "@127.0.0.1", "")
        }
    "#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn default_script_routes_to_loopback() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = DialplanEvaluator::load(store, "default", 200_000, 32)
            .await
            .unwrap();
        let descriptor = evaluator.lookup("100", None).await.unwrap();
        assert_eq!(descriptor.destination_uri, "100@127.0.0.1");
    }

    #[tokio::test]
    async fn recompiles_after_newer_source_is_saved() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = DialplanEvaluator::load(store.clone(), "default", 200_000, 32)
            .await
            .unwrap();

        store
            .save_dialplan(DialplanRecord {
                name: "default".to_string(),
                script_source: r#"
                    fn lookup(dialled_user, from_account) {
                        fwd("200@10.0.0.9", "")
                    }
                "#
                .to_string(),
                last_update: Utc::now() + chrono::Duration::seconds(5),
            })
            .await
            .unwrap();

        let descriptor = evaluator.lookup("100", None).await.unwrap();
        assert_eq!(descriptor.destination_uri, "200@10.0.0.9");
    }

    #[tokio::test]
    async fn compile_error_keeps_previous_version() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = DialplanEvaluator::load(store.clone(), "default", 200_000, 32)
            .await
            .unwrap();

        store
            .save_dialplan(DialplanRecord {
                name: "default".to_string(),
                script_source: "fn lookup(".to_string(),
                last_update: Utc::now() + chrono::Duration::seconds(5),
            })
            .await
            .unwrap();

        let descriptor = evaluator.lookup("100", None).await.unwrap();
        assert_eq!(descriptor.destination_uri, "100@127.0.0.1");
        assert!(evaluator.last_compile_error().is_some());
    }
}

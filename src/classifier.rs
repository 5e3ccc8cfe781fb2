use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use wasmtime::{
    Config, Engine, Linker, Module, ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder, Trap,
};

use crate::models::Post;

/// Granularity of the epoch ticker that enforces classifier deadlines.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Upper bound on guest linear memory.
const MAX_MEMORY_BYTES: usize = 64 * 1024 * 1024;

/// Input record handed to a classifier, serialized as JSON into guest
/// memory. This shape is the module-host contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostInput {
    pub did: String,
    pub rkey: String,
    pub text: String,
    pub langs: Vec<String>,
    pub created_at: i64,
    pub likes: i64,
    pub reply: bool,
}

impl From<&Post> for PostInput {
    fn from(post: &Post) -> Self {
        Self {
            did: post.did.clone(),
            rkey: post.rkey.clone(),
            text: post.text.clone(),
            langs: post.langs.clone(),
            created_at: post.created_at.unix_timestamp(),
            likes: post.likes as i64,
            reply: post.reply,
        }
    }
}

/// Shared engine for every classifier on this worker. A background thread
/// advances the epoch so per-call deadlines interrupt runaway guests.
#[derive(Clone)]
pub struct ClassifierRuntime {
    engine: Engine,
}

impl ClassifierRuntime {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = Engine::new(&config)?;

        let ticker = engine.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(EPOCH_TICK);
            ticker.increment_epoch();
        });

        Ok(Self { engine })
    }

    /// Compiles a classifier binary into an invocable instance.
    pub fn load(&self, binary: &[u8], timeout: Duration) -> Result<Classifier> {
        let module =
            Module::new(&self.engine, binary).context("could not compile classifier")?;

        let deadline_ticks =
            (timeout.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64;

        Ok(Classifier {
            engine: self.engine.clone(),
            module,
            deadline_ticks,
        })
    }
}

/// A loaded classifier bound to one feed. Each invocation instantiates a
/// fresh store, so guests cannot carry state or observe other posts.
pub struct Classifier {
    engine: Engine,
    module: Module,
    deadline_ticks: u64,
}

impl Classifier {
    /// Runs the classifier on one post and returns its weight. Blocks the
    /// calling thread; callers dispatch through a blocking pool.
    ///
    /// The guest gets no host imports (no I/O), a capped memory, and an
    /// epoch deadline derived from the configured timeout.
    pub fn classify(&self, input: &PostInput) -> Result<i64> {
        let payload = serde_json::to_vec(input)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(MAX_MEMORY_BYTES)
            .instances(1)
            .build();

        let mut store: Store<StoreLimits> = Store::new(&self.engine, limits);
        store.limiter(|limits| limits as &mut dyn ResourceLimiter);
        store.set_epoch_deadline(self.deadline_ticks);

        let linker: Linker<StoreLimits> = Linker::new(&self.engine);
        let instance = linker.instantiate(&mut store, &self.module)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("classifier does not export memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .context("classifier does not export alloc")?;
        let classify = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "classify")
            .context("classifier does not export classify")?;

        let len = payload.len() as i32;
        let ptr = alloc.call(&mut store, len)?;
        memory
            .write(&mut store, ptr as usize, &payload)
            .context("could not write post into classifier memory")?;

        let weight = classify.call(&mut store, (ptr, len))?;

        Ok(weight)
    }
}

/// Whether an invocation error was the epoch deadline firing.
pub fn is_deadline(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PostInput {
        PostInput {
            did: "did:plc:a".to_string(),
            rkey: "r1".to_string(),
            text: "hallo".to_string(),
            langs: vec!["de".to_string()],
            created_at: 1_714_564_800,
            likes: 3,
            reply: false,
        }
    }

    #[test]
    fn test_constant_weight_classifier() {
        let runtime = ClassifierRuntime::new().unwrap();

        let classifier = runtime
            .load(
                br#"
                (module
                  (memory (export "memory") 1)
                  (func (export "alloc") (param i32) (result i32) (i32.const 16))
                  (func (export "classify") (param i32 i32) (result i64) (i64.const 42)))
                "#,
                Duration::from_secs(1),
            )
            .unwrap();

        assert_eq!(classifier.classify(&input()).unwrap(), 42);
    }

    #[test]
    fn test_classifier_reads_input() {
        let runtime = ClassifierRuntime::new().unwrap();

        // Returns the payload length, proving the host wrote the record
        // into guest memory at the allocated offset.
        let classifier = runtime
            .load(
                br#"
                (module
                  (memory (export "memory") 1)
                  (func (export "alloc") (param i32) (result i32) (i32.const 16))
                  (func (export "classify") (param i32 i32) (result i64)
                    (i64.extend_i32_s (local.get 1))))
                "#,
                Duration::from_secs(1),
            )
            .unwrap();

        let post = input();
        let expected = serde_json::to_vec(&post).unwrap().len() as i64;
        assert_eq!(classifier.classify(&post).unwrap(), expected);
    }

    #[test]
    fn test_negative_weight_round_trips() {
        let runtime = ClassifierRuntime::new().unwrap();

        let classifier = runtime
            .load(
                br#"
                (module
                  (memory (export "memory") 1)
                  (func (export "alloc") (param i32) (result i32) (i32.const 16))
                  (func (export "classify") (param i32 i32) (result i64) (i64.const -1)))
                "#,
                Duration::from_secs(1),
            )
            .unwrap();

        assert_eq!(classifier.classify(&input()).unwrap(), -1);
    }

    #[test]
    fn test_runaway_classifier_hits_deadline() {
        let runtime = ClassifierRuntime::new().unwrap();

        let classifier = runtime
            .load(
                br#"
                (module
                  (memory (export "memory") 1)
                  (func (export "alloc") (param i32) (result i32) (i32.const 16))
                  (func (export "classify") (param i32 i32) (result i64)
                    (loop $spin (br $spin))
                    (i64.const 0)))
                "#,
                Duration::from_millis(50),
            )
            .unwrap();

        let err = classifier.classify(&input()).unwrap_err();
        assert!(is_deadline(&err), "expected deadline trap, got: {:?}", err);
    }

    #[test]
    fn test_module_without_contract_is_rejected() {
        let runtime = ClassifierRuntime::new().unwrap();

        let classifier = runtime
            .load(br#"(module)"#, Duration::from_secs(1))
            .unwrap();

        assert!(classifier.classify(&input()).is_err());
    }
}

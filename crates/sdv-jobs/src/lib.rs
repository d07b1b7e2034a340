//! sdv-jobs: background execution for slow crypto work
//!
//! Key generation (Argon2id + keypair) and bulk encryption run on a bounded
//! pool of blocking workers. Callers get a [`JobHandle`] immediately and
//! poll it with [`JobPool::await_completion`]; a client-side timeout never
//! cancels the job itself.
//!
//! ```text
//! Submitted ──► Running ──► Succeeded
//!                     └───► Failed(reason)
//! ```

pub mod job;
pub mod pool;

pub use job::{JobHandle, JobStatus};
pub use pool::JobPool;

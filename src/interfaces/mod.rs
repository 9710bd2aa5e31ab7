// Interface modules for the runtime collaborators the event core consumes.
//
// Each collaborator is a narrow trait with a lightweight production adapter
// so the core can run standalone. Runtimes plug in their own implementations
// through `Collaborators`.

pub mod introspection;
pub mod threading;

use std::sync::Arc;

pub use introspection::{
    CatchSite, CountingResolver, DetachedStack, IdentityResolver, StackIntrospection,
};
pub use threading::{
    ContextToken, ExecState, ExecutionContextSwitch, OsThreadScheduler, ThreadKey, ThreadKind,
    ThreadRef, ThreadStateSwitch, WorkerHandle, WorkerScheduler,
};

/// Bundle of collaborator implementations handed to the event system.
#[derive(Clone)]
pub struct Collaborators {
    pub stack: Arc<dyn StackIntrospection>,
    pub identity: Arc<dyn IdentityResolver>,
    pub context: Arc<dyn ExecutionContextSwitch>,
    pub scheduler: Arc<dyn WorkerScheduler>,
}

impl Collaborators {
    pub fn with_stack(mut self, stack: Arc<dyn StackIntrospection>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_context(mut self, context: Arc<dyn ExecutionContextSwitch>) -> Self {
        self.context = context;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn WorkerScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            stack: Arc::new(DetachedStack),
            identity: Arc::new(CountingResolver::new()),
            context: Arc::new(ThreadStateSwitch::new()),
            scheduler: Arc::new(OsThreadScheduler),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

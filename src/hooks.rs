//! Per-verb pre/post hooks.
//!
//! Every user-facing verb runs an optional pre-hook before delegating and a
//! post-hook afterwards. Both default to no-ops and can be overridden per
//! verb. A pre-hook returning `false` vetoes the verb; only `cset` honours
//! the veto (the write is skipped with a printed note), other verbs treat
//! the hook as advisory.

use std::collections::HashMap;

/// What a hook sees: the verb name and its rendered argument list.
#[derive(Clone, Debug)]
pub struct HookContext {
    pub verb: String,
    pub detail: String,
}

pub type PreHook = Box<dyn Fn(&HookContext) -> bool + Send + Sync>;
pub type PostHook = Box<dyn Fn(&HookContext) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    pre: HashMap<String, PreHook>,
    post: HashMap<String, PostHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pre-hook of one verb.
    pub fn set_pre(&mut self, verb: &str, hook: PreHook) {
        self.pre.insert(verb.to_string(), hook);
    }

    /// Replace the post-hook of one verb.
    pub fn set_post(&mut self, verb: &str, hook: PostHook) {
        self.post.insert(verb.to_string(), hook);
    }

    pub fn clear(&mut self, verb: &str) {
        self.pre.remove(verb);
        self.post.remove(verb);
    }

    /// Run the pre-hook; true (the default) lets the verb proceed.
    pub fn run_pre(&self, context: &HookContext) -> bool {
        match self.pre.get(&context.verb) {
            Some(hook) => hook(context),
            None => true,
        }
    }

    pub fn run_post(&self, context: &HookContext) {
        if let Some(hook) = self.post.get(&context.verb) {
            hook(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn context(verb: &str) -> HookContext {
        HookContext {
            verb: verb.to_string(),
            detail: String::new(),
        }
    }

    #[test]
    fn test_default_hooks_allow() {
        let hooks = HookRegistry::new();
        assert!(hooks.run_pre(&context("begin")));
        hooks.run_post(&context("begin"));
    }

    #[test]
    fn test_pre_hook_can_veto() {
        let mut hooks = HookRegistry::new();
        hooks.set_pre("cset", Box::new(|_| false));
        assert!(!hooks.run_pre(&context("cset")));
        // Other verbs unaffected.
        assert!(hooks.run_pre(&context("begin")));
    }

    #[test]
    fn test_post_hook_runs() {
        let fired = Arc::new(AtomicBool::new(false));
        let seen = fired.clone();
        let mut hooks = HookRegistry::new();
        hooks.set_post(
            "end",
            Box::new(move |ctx| {
                assert_eq!(ctx.verb, "end");
                seen.store(true, Ordering::SeqCst);
            }),
        );
        hooks.run_post(&context("end"));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_clear_restores_default() {
        let mut hooks = HookRegistry::new();
        hooks.set_pre("cset", Box::new(|_| false));
        hooks.clear("cset");
        assert!(hooks.run_pre(&context("cset")));
    }
}

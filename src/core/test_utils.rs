//! Test utilities for arena-based testing.
//!
//! Every emitter borrows a session, and every session borrows an arena, so
//! tests go through a [`test::TestContext`] that owns the arena and hands out
//! ready-made emitters for x86-64.

#[cfg(test)]
pub mod test {
    use super::super::config::EmitterConfig;
    use super::super::encoder::InstrEncoder;
    use super::super::error::EmitResult;
    use super::super::session::CompilationSession;
    use super::super::target::TargetInfo;
    use crate::emit::{Emitter, PrologEpilogGenerator};
    use crate::x64::X64Encoder;
    use bumpalo::Bump;

    /// Test context that manages arena lifetime for tests.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        /// Create a new test context with default capacity.
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// Create a test context with specified capacity.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                arena: Bump::with_capacity(capacity),
            }
        }

        /// Get a reference to the arena.
        pub fn arena(&self) -> &Bump {
            &self.arena
        }

        /// Create a compilation session using this context's arena.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        /// Get current memory usage for testing memory limits.
        pub fn memory_used(&self) -> usize {
            self.arena.allocated_bytes()
        }

        /// Run a test with a session, ensuring proper cleanup.
        pub fn with_session<F, R>(&self, f: F) -> R
        where
            F: FnOnce(&CompilationSession<'_>) -> R,
        {
            let session = self.create_session();
            f(&session)
        }

        /// Configuration used by tests: defaults with validation on.
        pub fn config(&self) -> EmitterConfig {
            EmitterConfig {
                validate: true,
                ..EmitterConfig::default()
            }
        }

        /// Run a test against a fresh x86-64 emitter.
        pub fn with_emitter<F, R>(&self, f: F) -> R
        where
            F: for<'s> FnOnce(&mut Emitter<'s, X64Encoder>) -> R,
        {
            self.with_emitter_config(self.config(), f)
        }

        /// Run a test against a fresh x86-64 emitter with `config`.
        pub fn with_emitter_config<F, R>(&self, config: EmitterConfig, f: F) -> R
        where
            F: for<'s> FnOnce(&mut Emitter<'s, X64Encoder>) -> R,
        {
            let session = CompilationSession::with_limit(&self.arena, config.arena_limit);
            let mut em = Emitter::new(&session, X64Encoder::new(), TargetInfo::x64(), config)
                .expect("emitter construction");
            f(&mut em)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Generator that leaves every prolog and epilog empty.
    pub struct NoPrologEpilog;

    impl<'a, E: InstrEncoder> PrologEpilogGenerator<'a, E> for NoPrologEpilog {
        fn gen_prolog(&mut self, _em: &mut Emitter<'a, E>) -> EmitResult<()> {
            Ok(())
        }

        fn gen_epilog(&mut self, _em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
            Ok(())
        }
    }

    /// Run a test with a temporary arena context.
    pub fn with_test_context<F, R>(f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let ctx = TestContext::new();
        f(&ctx)
    }

    /// Run a test with a memory-limited arena context.
    pub fn with_limited_context<F, R>(capacity: usize, f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let ctx = TestContext::with_capacity(capacity);
        f(&ctx)
    }
}

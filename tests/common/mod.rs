//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use bumpalo::Bump;
use igemit::core::{
    CompilationSession, EmitResult, EmitterConfig, FrameLayout, InstrEncoder, TargetInfo,
};
use igemit::emit::{Emitter, PrologEpilogGenerator};
use igemit::listing::{emit_text, EmittedMethod, ListingResult};
use igemit::x64::regs::RBP;
use igemit::x64::X64Encoder;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> EmitterConfig {
    EmitterConfig {
        validate: true,
        ..EmitterConfig::default()
    }
}

/// Run `f` against a fresh x86-64 emitter.
pub fn with_emitter<F, R>(config: EmitterConfig, f: F) -> R
where
    F: for<'s> FnOnce(&mut Emitter<'s, X64Encoder>) -> R,
{
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::with_limit(&arena, config.arena_limit);
    let mut em = Emitter::new(&session, X64Encoder::new(), TargetInfo::x64(), config)
        .expect("emitter construction");
    f(&mut em)
}

/// Parse and emit a listing with the test configuration.
pub fn emit(text: &str) -> ListingResult<EmittedMethod> {
    emit_with(text, config())
}

pub fn emit_with(text: &str, config: EmitterConfig) -> ListingResult<EmittedMethod> {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::with_limit(&arena, config.arena_limit);
    emit_text(&session, text, config)
}

/// Frame without prolog or epilog code, so body offsets start at zero.
pub struct NoFrame;

impl<'a, E: InstrEncoder> PrologEpilogGenerator<'a, E> for NoFrame {
    fn gen_prolog(&mut self, _em: &mut Emitter<'a, E>) -> EmitResult<()> {
        Ok(())
    }

    fn gen_epilog(&mut self, _em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
        Ok(())
    }
}

pub fn rbp_frame() -> FrameLayout {
    FrameLayout::new(RBP)
}

//! Branches between the root method and its funclets.

mod common;

use common::{config, emit, with_emitter, NoFrame};
use igemit::core::HandlerKind;
use igemit::emit::UnwindEventKind;
use igemit::gc::GcState;
use igemit::instr::{EmitAttr, Ins};
use igemit::listing::ListingError;
use igemit::x64::regs::RAX;
use igemit::EmitError;

const GUARDED: &str = "
    .method   guarded
    .handler  finally
    .handler  catch
    entry:
              callfinally fin
    resume:
              xor   eax, eax
    .epilog   1

    .func     1
    fin:
    .funclet_prolog 1
              xor   eax, eax
    .funclet_epilog 1

    .func     2
    catch:
    .funclet_prolog 2
              catchret resume
";

#[test]
fn finally_call_and_catch_return_are_accepted() {
    let method = emit(GUARDED).unwrap();
    let out = &method.output;

    assert_eq!(method.label_offset("entry"), Some(4));
    assert_eq!(method.label_offset("resume"), Some(9));
    assert_eq!(method.label_offset("fin"), Some(13));
    assert_eq!(method.label_offset("catch"), Some(18));

    // call fin: rel32 from the end of the call.
    assert_eq!(&out.hot[4..9], &[0xE8, 0x04, 0x00, 0x00, 0x00]);
    // The finally funclet starts with its own push rbp.
    assert_eq!(out.hot[13], 0x55);

    let funclet_prologs = out
        .unwind_events
        .iter()
        .filter(|e| e.kind == UnwindEventKind::FuncletPrologBegin)
        .map(|e| e.offset)
        .collect::<Vec<_>>();
    assert_eq!(funclet_prologs, vec![13, 18]);
}

#[test]
fn plain_jump_into_funclet_is_rejected() {
    let text = GUARDED.replace("callfinally fin", "jmp fin");
    let err = emit(&text).unwrap_err();
    assert!(matches!(
        err,
        ListingError::Pipeline(EmitError::IllegalFuncletBranch {
            from_func: 0,
            to_func: 1,
            ..
        })
    ));
}

#[test]
fn catch_return_must_reach_enclosing_code() {
    // A catch return may not enter another handler.
    let text = GUARDED.replace("catchret resume", "catchret fin");
    let err = emit(&text).unwrap_err();
    assert!(matches!(
        err,
        ListingError::Pipeline(EmitError::IllegalFuncletBranch { from_func: 2, .. })
    ));
}

#[test]
fn unknown_funclet_is_an_error() {
    let text = GUARDED.replace(".func     2", ".func     7");
    let err = emit(&text).unwrap_err();
    assert!(matches!(err, ListingError::Emit { .. }));
}

#[test]
fn label_address_may_name_another_funclet() {
    with_emitter(config(), |em| {
        let handler = em.new_label();
        em.ins_label_load(RAX, handler).unwrap();
        em.ins(Ins::Ret, EmitAttr::B8).unwrap();

        let func = em.add_handler(HandlerKind::Catch, None);
        em.set_current_func(func).unwrap();
        em.define_label(handler, &GcState::default()).unwrap();
        em.ins(Ins::Ret, EmitAttr::B8).unwrap();
        em.generate_prolog_epilog(&mut NoFrame).unwrap();

        em.jump_dist_bind().unwrap();
    });
}

#[test]
fn jump_to_the_same_label_is_still_checked() {
    with_emitter(config(), |em| {
        let handler = em.new_label();
        em.ins_jump(Ins::Jmp, handler).unwrap();

        let func = em.add_handler(HandlerKind::Catch, None);
        em.set_current_func(func).unwrap();
        em.define_label(handler, &GcState::default()).unwrap();
        em.ins(Ins::Ret, EmitAttr::B8).unwrap();
        em.generate_prolog_epilog(&mut NoFrame).unwrap();

        let err = em.jump_dist_bind().unwrap_err();
        assert!(matches!(
            err,
            EmitError::IllegalFuncletBranch {
                from_func: 0,
                to_func: 1,
                ..
            }
        ));
    });
}

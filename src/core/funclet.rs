//! Funclets and exception-handling regions.
//!
//! Every group belongs to one function: the root method (index 0) or one of
//! its handler funclets. Branches may only cross between functions in two
//! shapes, checked by [`check_funclet_branch`].

use super::error::{EmitError, EmitResult};
use crate::emit::group::GroupId;
use crate::instr::desc::JumpInfo;

/// Kind of an exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch,
    Finally,
    Fault,
    Filter,
}

/// One exception-handling region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhRegion {
    pub handler: HandlerKind,
    /// Region whose handler lexically encloses this region's handler.
    pub enclosing_handler: Option<u32>,
    /// Funclet implementing this region's handler.
    pub handler_func: u16,
}

/// Role of a function in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Root,
    Handler { region: u32 },
    Filter { region: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncInfo {
    pub kind: FuncKind,
    /// First group emitted for this function.
    pub first_group: Option<GroupId>,
}

/// Root method plus its funclets.
#[derive(Debug, Clone)]
pub struct FuncletTable {
    pub funcs: Vec<FuncInfo>,
    pub regions: Vec<EhRegion>,
}

impl Default for FuncletTable {
    fn default() -> Self {
        Self {
            funcs: vec![FuncInfo {
                kind: FuncKind::Root,
                first_group: None,
            }],
            regions: Vec::new(),
        }
    }
}

impl FuncletTable {
    /// Add a region and the funclet implementing its handler. Returns the
    /// funclet index.
    pub fn add_handler(&mut self, handler: HandlerKind, enclosing_handler: Option<u32>) -> u16 {
        let region = self.regions.len() as u32;
        let func = self.funcs.len() as u16;
        self.regions.push(EhRegion {
            handler,
            enclosing_handler,
            handler_func: func,
        });
        self.funcs.push(FuncInfo {
            kind: if handler == HandlerKind::Filter {
                FuncKind::Filter { region }
            } else {
                FuncKind::Handler { region }
            },
            first_group: None,
        });
        func
    }

    /// Region index of a funclet index, if it is a handler.
    pub fn region_of(&self, func: u16) -> Option<&EhRegion> {
        match self.funcs.get(func as usize)?.kind {
            FuncKind::Root => None,
            FuncKind::Handler { region } | FuncKind::Filter { region } => {
                self.regions.get(region as usize)
            }
        }
    }

    pub fn count(&self) -> usize {
        self.funcs.len()
    }
}

/// Reject branches that leave their funclet other than as a finally call
/// into the start of a finally handler or a catch return to the enclosing
/// handler (or the root).
pub fn check_funclet_branch(
    table: &FuncletTable,
    from_func: u16,
    to_func: u16,
    jump: &JumpInfo,
    target: GroupId,
) -> EmitResult<()> {
    if from_func == to_func {
        return Ok(());
    }
    let illegal = |reason| EmitError::IllegalFuncletBranch {
        from_func,
        to_func,
        reason,
    };

    if jump.finally_call {
        let to = table
            .funcs
            .get(to_func as usize)
            .ok_or(illegal("unknown target funclet"))?;
        let is_finally = table
            .region_of(to_func)
            .is_some_and(|r| r.handler == HandlerKind::Finally);
        if !is_finally {
            return Err(illegal("finally call into a non-finally funclet"));
        }
        if to.first_group != Some(target) {
            return Err(illegal("finally call must target the handler entry"));
        }
        return Ok(());
    }

    if jump.catch_ret {
        let region = table
            .region_of(from_func)
            .ok_or(illegal("catch return from the root method"))?;
        if region.handler != HandlerKind::Catch {
            return Err(illegal("catch return outside a catch handler"));
        }
        let expected = match region.enclosing_handler {
            Some(enclosing) => table
                .regions
                .get(enclosing as usize)
                .map(|r| r.handler_func)
                .ok_or(illegal("unknown enclosing region"))?,
            None => 0,
        };
        if to_func != expected {
            return Err(illegal("catch return must target the enclosing handler"));
        }
        return Ok(());
    }

    Err(illegal("branch crosses a funclet boundary"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::group::Label;

    fn table() -> (FuncletTable, u16, u16, u16) {
        let mut table = FuncletTable::default();
        let finally = table.add_handler(HandlerKind::Finally, None);
        let catch = table.add_handler(HandlerKind::Catch, None);
        let nested = table.add_handler(HandlerKind::Catch, Some(1));
        table.funcs[finally as usize].first_group = Some(GroupId(10));
        (table, finally, catch, nested)
    }

    #[test]
    fn test_same_funclet_is_always_legal() {
        let (table, _, catch, _) = table();
        let jump = JumpInfo::to_label(Label(0));
        assert!(check_funclet_branch(&table, catch, catch, &jump, GroupId(3)).is_ok());
    }

    #[test]
    fn test_finally_call() {
        let (table, finally, catch, _) = table();
        let mut jump = JumpInfo::to_label(Label(0));
        jump.finally_call = true;
        assert!(check_funclet_branch(&table, 0, finally, &jump, GroupId(10)).is_ok());
        assert!(check_funclet_branch(&table, 0, finally, &jump, GroupId(11)).is_err());
        assert!(check_funclet_branch(&table, 0, catch, &jump, GroupId(10)).is_err());
    }

    #[test]
    fn test_catch_return() {
        let (table, finally, catch, nested) = table();
        let mut jump = JumpInfo::to_label(Label(0));
        jump.catch_ret = true;
        assert!(check_funclet_branch(&table, catch, 0, &jump, GroupId(1)).is_ok());
        assert!(check_funclet_branch(&table, nested, catch, &jump, GroupId(1)).is_ok());
        assert!(check_funclet_branch(&table, nested, 0, &jump, GroupId(1)).is_err());
        assert!(check_funclet_branch(&table, finally, 0, &jump, GroupId(1)).is_err());
    }

    #[test]
    fn test_plain_cross_branch_rejected() {
        let (table, _, catch, _) = table();
        let jump = JumpInfo::to_label(Label(0));
        let err = check_funclet_branch(&table, 0, catch, &jump, GroupId(4)).unwrap_err();
        assert!(matches!(err, EmitError::IllegalFuncletBranch { from_func: 0, .. }));
    }
}

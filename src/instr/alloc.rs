// Instruction record allocation. Every record gets the smallest payload variant able to hold
// its constant and displacement: both absent or small fit the Small form, and the Cns, Dsp and
// CnsDsp forms add full-width fields as needed. Calls always get the Call form and label
// references the Jump form. The allocator numbers records in creation order; with the
// debug-info feature it also keeps a side table, indexed by that number, recording the IL
// offset current at creation and the record footprint.

//! Instruction record allocator.

use super::desc::{
    AddrOperand, CallInfo, EmitAttr, GcKind, Ins, InsFormat, InstrDesc, JumpInfo, OpSize, Payload,
};

/// Per-record debug information kept beside the records.
#[cfg(feature = "debug-info")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrDebugInfo {
    pub num: u32,
    pub il_offset: u32,
    pub footprint: usize,
}

/// Builds instruction records and hands out their numbers.
#[derive(Debug)]
pub struct InstrAllocator {
    ptr_size: u32,
    next_num: u32,
    il_offset: u32,
    #[cfg(feature = "debug-info")]
    debug: Vec<InstrDebugInfo>,
}

impl InstrAllocator {
    pub fn new(ptr_size: u32) -> Self {
        Self {
            ptr_size,
            next_num: 0,
            il_offset: 0,
            #[cfg(feature = "debug-info")]
            debug: Vec::new(),
        }
    }

    /// Number of records allocated so far.
    pub fn count(&self) -> u32 {
        self.next_num
    }

    /// IL offset attributed to subsequently allocated records.
    pub fn set_il_offset(&mut self, il_offset: u32) {
        self.il_offset = il_offset;
    }

    #[cfg(feature = "debug-info")]
    pub fn debug_info(&self) -> &[InstrDebugInfo] {
        &self.debug
    }

    #[cfg(feature = "debug-info")]
    pub fn debug_info_for(&self, num: u32) -> Option<&InstrDebugInfo> {
        self.debug.get(num as usize)
    }

    fn base<'a>(&mut self, ins: Ins, fmt: InsFormat, attr: EmitAttr, payload: Payload<'a>) -> InstrDesc<'a> {
        let (size, gc) = attr.resolve(self.ptr_size);
        let desc = InstrDesc {
            num: self.next_num,
            ins,
            fmt,
            size,
            gc,
            reg1: None,
            reg2: None,
            ext: None,
            addr: AddrOperand::None,
            small_cns: 0,
            code_size: 0,
            payload,
        };
        #[cfg(feature = "debug-info")]
        self.debug.push(InstrDebugInfo {
            num: desc.num,
            il_offset: self.il_offset,
            footprint: desc.footprint(),
        });
        self.next_num += 1;
        desc
    }

    /// Allocate an ordinary record carrying constant `cns` and displacement `dsp`.
    pub fn alloc<'a>(&mut self, ins: Ins, fmt: InsFormat, attr: EmitAttr, cns: i64, dsp: i64) -> InstrDesc<'a> {
        let small = InstrDesc::fits_small_cns(cns);
        let payload = match (dsp == 0, small) {
            (true, true) => Payload::Small,
            (true, false) => Payload::Cns(cns),
            (false, true) => Payload::Dsp(dsp),
            (false, false) => Payload::CnsDsp { cns, dsp },
        };
        let mut desc = self.base(ins, fmt, attr, payload);
        if small {
            desc.small_cns = cns as i16;
        }
        desc
    }

    /// Allocate a call record. `ret` describes the value returned in the
    /// return register.
    pub fn alloc_call<'a>(&mut self, fmt: InsFormat, ret: EmitAttr, info: CallInfo<'a>) -> InstrDesc<'a> {
        let mut desc = self.base(Ins::Call, fmt, EmitAttr::B8, Payload::Call(info));
        desc.size = OpSize::from_bytes(self.ptr_size).unwrap_or(OpSize::B8);
        desc.gc = ret.resolve(self.ptr_size).1;
        desc
    }

    /// Allocate a label-targeted record.
    pub fn alloc_jump<'a>(&mut self, ins: Ins, attr: EmitAttr, info: JumpInfo) -> InstrDesc<'a> {
        self.base(ins, InsFormat::Label, attr, Payload::Jump(info))
    }
}

/// GC kind carried by a record's defining write, if it defines a register.
pub fn defined_gc_kind(desc: &InstrDesc<'_>) -> Option<GcKind> {
    let defines = match desc.fmt {
        InsFormat::R | InsFormat::RR | InsFormat::RI | InsFormat::RRI | InsFormat::RM => {
            desc.ins.writes_reg1()
        }
        InsFormat::Label => desc.ins == Ins::Lea,
        _ => false,
    };
    defines.then_some(desc.gc)
}

//! Listing parser.
//!
//! The format is line oriented; `;` starts a comment. A line is a directive
//! (`.name args`), a label definition (`name:` optionally followed by the GC
//! state live at the label) or an instruction:
//!
//! ```text
//! .method  sum
//! .frame   locals=16 save=rbx
//! .var     0 -8 gcref this      ; tracked slot: number, rbp offset, kind
//! .slot    1 -16                ; untracked slot
//! .data    k0 00 00 00 00 00 00 f0 3f align8
//! top:     gcref=rbx vars=0
//!          mov   rax, qword [V1+0]
//!          mov   rbx, [rcx+rdx*8+0x10] !gcref
//!          call  #12 args=0 ret=gcref gcref=rbx
//!          je.s  done
//!          jmp   top
//! .epilog  1 gcref=rax
//! done:
//!          ret
//! ```

use super::{
    CallAttrs, GcSpec, InstrLine, Item, Line, Listing, ListingError, ListingResult, MemRef,
    Mnemonic, Operand, SlotDecl,
};
use crate::core::funclet::HandlerKind;
use crate::core::regs::AsmReg;
use crate::emit::PlaceholderKind;
use crate::instr::desc::{GcKind, Ins, OpSize};
use crate::x64::regs::parse_reg;

/// Parse a listing.
pub fn parse_listing(text: &str) -> ListingResult<Listing> {
    let mut listing = Listing {
        name: "method".to_string(),
        ..Listing::default()
    };
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let code = raw.split(';').next().unwrap_or("").trim();
        if code.is_empty() {
            continue;
        }
        let mut cur = Cursor::new(code, line);
        if cur.try_read('.') {
            parse_directive(&mut cur, &mut listing)?;
        } else if let Some((name, rest)) = split_label(code) {
            let mut cur = Cursor::new(rest, line);
            let gc = parse_gc_spec(&mut cur)?;
            cur.expect_end()?;
            listing.lines.push(Line {
                line,
                item: Item::Label {
                    name: name.to_string(),
                    gc,
                },
            });
        } else {
            let instr = parse_instr(&mut cur)?;
            listing.lines.push(Line {
                line,
                item: Item::Instr(instr),
            });
        }
    }
    Ok(listing)
}

/// `name:` at the start of a line.
fn split_label(code: &str) -> Option<(&str, &str)> {
    let colon = code.find(':')?;
    let name = &code[..colon];
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| (name, &code[colon + 1..]))
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self { text, pos: 0, line }
    }

    fn error(&self, msg: impl Into<String>) -> ListingError {
        ListingError::Syntax {
            line: self.line,
            msg: msg.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn current_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn is_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.text.len()
    }

    fn expect_end(&mut self) -> ListingResult<()> {
        if self.is_end() {
            Ok(())
        } else {
            Err(self.error(format!("unexpected '{}'", self.rest())))
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> ListingResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!(
                "expected '{ch}' but found {:?}",
                self.current_char()
            )));
        }
        Ok(())
    }

    fn peek_is(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        self.current_char() == Some(ch)
    }

    fn read_identifier(&mut self) -> ListingResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{ch}'"))),
            None => return Err(self.error("expected identifier but found end of line")),
        }
        while self
            .current_char()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            self.advance();
        }
        Ok(&self.text[start..self.pos])
    }

    /// Read a token up to whitespace, ',' or ']'.
    fn read_word(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .current_char()
            .is_some_and(|ch| !ch.is_whitespace() && ch != ',' && ch != ']')
        {
            self.advance();
        }
        &self.text[start..self.pos]
    }

    /// Read a whitespace-delimited token.
    fn read_token(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;
        while self.current_char().is_some_and(|ch| !ch.is_whitespace()) {
            self.advance();
        }
        &self.text[start..self.pos]
    }

    fn starts_number(&mut self) -> bool {
        self.skip_whitespace();
        let mut chars = self.rest().chars();
        match chars.next() {
            Some(c) if c.is_ascii_digit() => true,
            Some('-') | Some('+') => chars.next().is_some_and(|c| c.is_ascii_digit()),
            _ => false,
        }
    }

    fn read_number(&mut self) -> ListingResult<i64> {
        let word = self.read_word();
        parse_number(word).ok_or_else(|| self.error(format!("invalid number '{word}'")))
    }

    fn read_unsigned<T: TryFrom<i64>>(&mut self) -> ListingResult<T> {
        let value = self.read_number()?;
        T::try_from(value).map_err(|_| self.error(format!("{value} is out of range")))
    }
}

fn parse_number(word: &str) -> Option<i64> {
    let (neg, digits) = match word.as_bytes().first()? {
        b'-' => (true, &word[1..]),
        b'+' => (false, &word[1..]),
        _ => (false, word),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()? as i64
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if neg { value.wrapping_neg() } else { value })
}

fn parse_reg_list(cur: &Cursor<'_>, list: &str) -> ListingResult<Vec<AsmReg>> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|name| {
            parse_reg(name)
                .map(|(reg, _)| reg)
                .ok_or_else(|| cur.error(format!("unknown register '{name}'")))
        })
        .collect()
}

fn parse_gc_kind(cur: &Cursor<'_>, word: &str) -> ListingResult<GcKind> {
    match word {
        "gcref" => Ok(GcKind::GcRef),
        "byref" => Ok(GcKind::ByRef),
        "none" => Ok(GcKind::None),
        _ => Err(cur.error(format!("unknown GC kind '{word}'"))),
    }
}

/// Apply one `key=value` GC annotation; returns false for other keys.
fn apply_gc_key(cur: &Cursor<'_>, spec: &mut GcSpec, key: &str, value: &str) -> ListingResult<bool> {
    match key {
        "gcref" => spec.gcref = parse_reg_list(cur, value)?,
        "byref" => spec.byref = parse_reg_list(cur, value)?,
        "vars" => {
            spec.vars = value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|v| {
                    v.parse::<u32>()
                        .map_err(|_| cur.error(format!("invalid variable index '{v}'")))
                })
                .collect::<ListingResult<_>>()?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_gc_spec(cur: &mut Cursor<'_>) -> ListingResult<GcSpec> {
    let mut spec = GcSpec::default();
    while !cur.is_end() {
        let word = cur.read_token();
        let Some((key, value)) = word.split_once('=') else {
            return Err(cur.error(format!("expected key=value, found '{word}'")));
        };
        if !apply_gc_key(cur, &mut spec, key, value)? {
            return Err(cur.error(format!("unknown GC annotation '{key}'")));
        }
    }
    Ok(spec)
}

fn parse_directive(cur: &mut Cursor<'_>, listing: &mut Listing) -> ListingResult<()> {
    let name = cur.read_identifier()?;
    let line = cur.line;

    let item = match name {
        "method" => {
            listing.name = cur.read_token().to_string();
            None
        }
        "frame" => {
            while !cur.is_end() {
                let word = cur.read_token();
                match word.split_once('=') {
                    Some(("locals", v)) => {
                        listing.locals_size = parse_number(v)
                            .and_then(|n| u32::try_from(n).ok())
                            .ok_or_else(|| cur.error(format!("invalid locals size '{v}'")))?;
                    }
                    Some(("save", v)) => listing.saved = parse_reg_list(cur, v)?,
                    _ => return Err(cur.error(format!("unknown frame option '{word}'"))),
                }
            }
            None
        }
        "var" | "slot" => {
            let var = cur.read_number()?;
            let var = i32::try_from(var).map_err(|_| cur.error("variable number out of range"))?;
            let offset = cur.read_number()?;
            let offset = i32::try_from(offset).map_err(|_| cur.error("frame offset out of range"))?;
            let mut decl = SlotDecl {
                var,
                offset,
                gc: GcKind::None,
                is_this: false,
            };
            if name == "var" {
                let kind = cur.read_token();
                decl.gc = parse_gc_kind(cur, kind)?;
                if decl.gc == GcKind::None {
                    return Err(cur.error("tracked slots must be gcref or byref"));
                }
                if !cur.is_end() {
                    match cur.read_token() {
                        "this" => decl.is_this = true,
                        other => return Err(cur.error(format!("unexpected '{other}'"))),
                    }
                }
            }
            listing.slots.push(decl);
            None
        }
        "data" => {
            let name = cur.read_identifier()?.to_string();
            let mut bytes = Vec::new();
            let mut align8 = false;
            while !cur.is_end() {
                let word = cur.read_token();
                if word == "align8" {
                    align8 = true;
                    continue;
                }
                let byte = u8::from_str_radix(word, 16)
                    .map_err(|_| cur.error(format!("invalid data byte '{word}'")))?;
                bytes.push(byte);
            }
            if bytes.is_empty() {
                return Err(cur.error("data constant without bytes"));
            }
            Some(Item::Data { name, bytes, align8 })
        }
        "reserve" => {
            let name = cur.read_identifier()?.to_string();
            let size = cur.read_unsigned::<u32>()?;
            let align8 = !cur.is_end() && cur.read_token() == "align8";
            Some(Item::Reserve { name, size, align8 })
        }
        "table" => {
            let name = cur.read_identifier()?.to_string();
            let mut labels = Vec::new();
            let mut relative = false;
            while !cur.is_end() {
                let word = cur.read_identifier()?;
                if word == "rel" {
                    relative = true;
                } else {
                    labels.push(word.to_string());
                }
            }
            Some(Item::Table {
                name,
                labels,
                relative,
            })
        }
        "epilog" | "funclet_prolog" | "funclet_epilog" => {
            let kind = match name {
                "epilog" => PlaceholderKind::Epilog,
                "funclet_prolog" => PlaceholderKind::FuncletProlog,
                _ => PlaceholderKind::FuncletEpilog,
            };
            let block = if cur.starts_number() {
                cur.read_unsigned::<u32>()?
            } else {
                0
            };
            let gc = parse_gc_spec(cur)?;
            Some(Item::Placeholder { kind, block, gc })
        }
        "handler" => {
            let kind = match cur.read_token() {
                "catch" => HandlerKind::Catch,
                "finally" => HandlerKind::Finally,
                "fault" => HandlerKind::Fault,
                "filter" => HandlerKind::Filter,
                other => return Err(cur.error(format!("unknown handler kind '{other}'"))),
            };
            let mut parent = None;
            if !cur.is_end() {
                let word = cur.read_token();
                let value = word
                    .strip_prefix("parent=")
                    .and_then(|v| v.parse::<u32>().ok())
                    .ok_or_else(|| cur.error(format!("expected parent=<region>, found '{word}'")))?;
                parent = Some(value);
            }
            Some(Item::Handler { kind, parent })
        }
        "func" => Some(Item::Func(cur.read_unsigned::<u16>()?)),
        "cold" => Some(Item::Cold),
        "nogc" => Some(Item::NoGc),
        "gc" => Some(Item::Gc),
        "stack" => Some(Item::Stack(cur.read_unsigned::<u32>()?)),
        "il" => Some(Item::Il(cur.read_unsigned::<u32>()?)),
        "finally_target" => Some(Item::FinallyTarget),
        other => return Err(cur.error(format!("unknown directive '.{other}'"))),
    };
    cur.expect_end()?;
    if let Some(item) = item {
        listing.lines.push(Line { line, item });
    }
    Ok(())
}

fn size_keyword(word: &str) -> Option<OpSize> {
    match word {
        "byte" => Some(OpSize::B1),
        "word" => Some(OpSize::B2),
        "dword" => Some(OpSize::B4),
        "qword" => Some(OpSize::B8),
        _ => None,
    }
}

fn parse_instr(cur: &mut Cursor<'_>) -> ListingResult<InstrLine> {
    let name = cur.read_identifier()?;
    let short = if cur.rest().starts_with(".s") {
        cur.advance();
        cur.advance();
        true
    } else {
        false
    };
    let mnemonic = match name {
        "callfinally" => Mnemonic::CallFinally,
        "catchret" => Mnemonic::CatchRet,
        _ => Mnemonic::Ins(
            Ins::from_name(name).ok_or_else(|| cur.error(format!("unknown mnemonic '{name}'")))?,
        ),
    };
    if short && !matches!(mnemonic, Mnemonic::Ins(ins) if ins.is_variable_branch()) {
        return Err(cur.error(format!("'.s' only applies to branches, not {name}")));
    }

    let mut instr = InstrLine {
        mnemonic,
        short,
        operands: Vec::new(),
        gc: None,
        call: CallAttrs::default(),
    };

    if !cur.is_end() && !cur.peek_is('!') && !looks_like_attr(cur.rest()) {
        loop {
            instr.operands.push(parse_operand(cur)?);
            if !cur.try_read(',') {
                break;
            }
        }
    }

    while !cur.is_end() {
        let word = cur.read_token();
        match word {
            "!gcref" => instr.gc = Some(GcKind::GcRef),
            "!byref" => instr.gc = Some(GcKind::ByRef),
            "nogc" => instr.call.no_gc = true,
            _ => {
                let Some((key, value)) = word.split_once('=') else {
                    return Err(cur.error(format!("unexpected '{word}'")));
                };
                match key {
                    "args" => {
                        instr.call.args = value
                            .parse::<i32>()
                            .map_err(|_| cur.error(format!("invalid argument count '{value}'")))?;
                    }
                    "ret" => instr.call.ret = parse_gc_kind(cur, value)?,
                    _ => {
                        if !apply_gc_key(cur, &mut instr.call.live, key, value)? {
                            return Err(cur.error(format!("unknown attribute '{key}'")));
                        }
                    }
                }
            }
        }
    }
    Ok(instr)
}

fn looks_like_attr(rest: &str) -> bool {
    let word = rest.split_whitespace().next().unwrap_or("");
    word == "nogc" || word.contains('=')
}

fn parse_operand(cur: &mut Cursor<'_>) -> ListingResult<Operand> {
    cur.skip_whitespace();
    if cur.try_read('#') {
        return Ok(Operand::Method(cur.read_unsigned::<u32>()?));
    }
    if cur.starts_number() {
        return Ok(Operand::Imm(cur.read_number()?));
    }
    if cur.peek_is('[') {
        return Ok(Operand::Mem(parse_mem(cur)?, None));
    }

    let word = cur.read_identifier()?;
    if let Some(size) = size_keyword(word) {
        let save = cur.pos;
        if cur.read_identifier().ok() != Some("ptr") {
            cur.pos = save;
        }
        return Ok(Operand::Mem(parse_mem(cur)?, Some(size)));
    }
    if let Some((reg, size)) = parse_reg(word) {
        return Ok(Operand::Reg(reg, size));
    }
    Ok(Operand::Label(word.to_string()))
}

fn parse_mem(cur: &mut Cursor<'_>) -> ListingResult<MemRef> {
    cur.expect('[')?;
    cur.skip_whitespace();

    let mem = if cur.rest().starts_with("data ") {
        cur.read_identifier()?;
        let name = cur.read_identifier()?.to_string();
        let disp = if cur.try_read('+') {
            cur.read_unsigned::<u32>()?
        } else {
            0
        };
        MemRef::Data { name, disp }
    } else if cur.rest().starts_with("abs ") {
        cur.read_identifier()?;
        MemRef::Abs(cur.read_number()? as u64)
    } else if let Some(var) = lcl_var_prefix(cur.rest()) {
        let word = cur.read_identifier()?;
        let num: i32 = word[1..]
            .parse()
            .map_err(|_| cur.error(format!("invalid slot '{word}'")))?;
        let offs = if cur.try_read('+') {
            cur.read_unsigned::<u32>()?
        } else {
            0
        };
        MemRef::Lcl {
            var: if var == 'T' { -num } else { num },
            offs,
        }
    } else {
        parse_amd(cur)?
    };
    cur.expect(']')?;
    Ok(mem)
}

/// `V<digits>` or `T<digits>` at the start of a memory operand.
fn lcl_var_prefix(rest: &str) -> Option<char> {
    let mut chars = rest.chars();
    let tag = chars.next().filter(|c| *c == 'V' || *c == 'T')?;
    chars.next().filter(char::is_ascii_digit).map(|_| tag)
}

/// `base + index*scale +/- disp`, every part optional.
fn parse_amd(cur: &mut Cursor<'_>) -> ListingResult<MemRef> {
    let mut base = None;
    let mut index = None;
    let mut scale = 1u8;
    let mut disp = 0i64;
    let mut negate = false;

    loop {
        cur.skip_whitespace();
        if cur.starts_number() {
            let value = cur_number_term(cur)?;
            disp += if negate { -value } else { value };
        } else {
            let name = cur.read_identifier()?;
            let (reg, size) =
                parse_reg(name).ok_or_else(|| cur.error(format!("unknown register '{name}'")))?;
            if size != OpSize::B8 {
                return Err(cur.error(format!("address register '{name}' must be 64-bit")));
            }
            if negate {
                return Err(cur.error("registers cannot be subtracted"));
            }
            if cur.try_read('*') {
                let value = cur_number_term(cur)?;
                scale = u8::try_from(value)
                    .map_err(|_| cur.error(format!("invalid scale {value}")))?;
                if index.replace(reg).is_some() {
                    return Err(cur.error("two index registers"));
                }
            } else if base.is_none() {
                base = Some(reg);
            } else if index.is_none() {
                index = Some(reg);
            } else {
                return Err(cur.error("too many registers in address"));
            }
        }

        if cur.try_read('+') {
            negate = false;
        } else if cur.try_read('-') {
            negate = true;
        } else {
            break;
        }
    }
    Ok(MemRef::Amd {
        base,
        index,
        scale,
        disp,
    })
}

/// A number inside an address; stops at operators.
fn cur_number_term(cur: &mut Cursor<'_>) -> ListingResult<i64> {
    cur.skip_whitespace();
    let start = cur.pos;
    while cur
        .current_char()
        .is_some_and(|ch| ch.is_ascii_alphanumeric())
    {
        cur.advance();
    }
    let word = &cur.text[start..cur.pos];
    parse_number(word).ok_or_else(|| cur.error(format!("invalid displacement '{word}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::regs::{RAX, RBX, RCX, RDX};

    fn instr(text: &str) -> InstrLine {
        let listing = parse_listing(text).unwrap();
        match &listing.lines[0].item {
            Item::Instr(i) => i.clone(),
            other => panic!("expected instruction, got {other:?}"),
        }
    }

    #[test]
    fn test_register_and_immediate_operands() {
        let i = instr("add eax, -0x10");
        assert_eq!(i.mnemonic, Mnemonic::Ins(Ins::Add));
        assert_eq!(i.operands, vec![Operand::Reg(RAX, OpSize::B4), Operand::Imm(-16)]);
    }

    #[test]
    fn test_memory_operands() {
        let i = instr("mov rbx, [rcx+rdx*8+0x10] !gcref");
        assert_eq!(i.gc, Some(GcKind::GcRef));
        assert_eq!(
            i.operands[1],
            Operand::Mem(
                MemRef::Amd {
                    base: Some(RCX),
                    index: Some(RDX),
                    scale: 8,
                    disp: 0x10
                },
                None
            )
        );

        let i = instr("mov dword ptr [V3+4], 7");
        assert_eq!(
            i.operands[0],
            Operand::Mem(MemRef::Lcl { var: 3, offs: 4 }, Some(OpSize::B4))
        );
        let i = instr("lea rax, [T2]");
        assert_eq!(i.operands[1], Operand::Mem(MemRef::Lcl { var: -2, offs: 0 }, None));
        let i = instr("mov rax, [data k0+8]");
        assert_eq!(
            i.operands[1],
            Operand::Mem(MemRef::Data { name: "k0".into(), disp: 8 }, None)
        );
        let i = instr("mov rax, [rbp-8]");
        assert!(matches!(i.operands[1], Operand::Mem(MemRef::Amd { disp: -8, .. }, None)));
    }

    #[test]
    fn test_call_attributes() {
        let i = instr("call #12 args=2 ret=gcref gcref=rbx vars=0,3 nogc");
        assert_eq!(i.operands, vec![Operand::Method(12)]);
        assert_eq!(i.call.args, 2);
        assert_eq!(i.call.ret, GcKind::GcRef);
        assert_eq!(i.call.live.gcref, vec![RBX]);
        assert_eq!(i.call.live.vars, vec![0, 3]);
        assert!(i.call.no_gc);
    }

    #[test]
    fn test_branches_and_labels() {
        let text = "
            top: gcref=rax vars=1  ; loop head
                 jne.s top
                 jmp   out
            out:
                 ret
        ";
        let listing = parse_listing(text).unwrap();
        assert_eq!(listing.lines.len(), 5);
        assert_eq!(
            listing.lines[0].item,
            Item::Label {
                name: "top".into(),
                gc: GcSpec {
                    gcref: vec![RAX],
                    byref: vec![],
                    vars: vec![1]
                }
            }
        );
        let Item::Instr(jne) = &listing.lines[1].item else {
            panic!("expected instruction");
        };
        assert!(jne.short);
        assert_eq!(jne.operands, vec![Operand::Label("top".into())]);
        assert_eq!(listing.lines[1].line, 3);
    }

    #[test]
    fn test_directives() {
        let text = "
            .method  demo
            .frame   locals=24 save=rbx,r12
            .var     0 -8 gcref this
            .slot    1 -16
            .data    k0 01 02 03 04 align8
            .table   jt a b rel
            .epilog  2 gcref=rax
            .handler finally parent=0
        ";
        let listing = parse_listing(text).unwrap();
        assert_eq!(listing.name, "demo");
        assert_eq!(listing.locals_size, 24);
        assert_eq!(listing.saved.len(), 2);
        assert_eq!(listing.slots[0].gc, GcKind::GcRef);
        assert!(listing.slots[0].is_this);
        assert_eq!(listing.slots[1].gc, GcKind::None);
        assert_eq!(
            listing.lines[0].item,
            Item::Data {
                name: "k0".into(),
                bytes: vec![1, 2, 3, 4],
                align8: true
            }
        );
        assert!(matches!(&listing.lines[1].item, Item::Table { relative: true, labels, .. } if labels.len() == 2));
        assert!(matches!(
            &listing.lines[2].item,
            Item::Placeholder { kind: PlaceholderKind::Epilog, block: 2, gc } if gc.gcref == vec![RAX]
        ));
        assert_eq!(
            listing.lines[3].item,
            Item::Handler {
                kind: HandlerKind::Finally,
                parent: Some(0)
            }
        );
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse_listing("ret\nfrobnicate rax").unwrap_err();
        assert!(matches!(err, ListingError::Syntax { line: 2, .. }));
        let err = parse_listing(".var 0 -8 none").unwrap_err();
        assert!(matches!(err, ListingError::Syntax { line: 1, .. }));
        assert!(parse_listing("mov.s rax, rbx").is_err());
    }
}

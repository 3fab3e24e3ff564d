//! x86-64 byte emitter.
//!
//! Every abstract [`Instr`](crate::isel::Instr) becomes a fixed byte
//! sequence here; the only indirection left for later is the relocator
//! patching `call` targets and the negation mask's address.

use crate::abi::{Abi, GpRegister};
use crate::ast::BinOp;
use crate::isel::Instr;
use crate::link::{Relocation, RelocationKind, RelocationTarget};

/// Emit a full function body for `instrs`, targeting `abi`'s calling
/// convention. Returns the code bytes and the relocations still pending
/// against them.
pub fn emit(instrs: &[Instr], abi: &dyn Abi) -> (Vec<u8>, Vec<Relocation>) {
    let stack_bytes = instrs
        .iter()
        .find_map(|i| match i {
            Instr::StackAllocate { size } => Some(*size),
            _ => None,
        })
        .unwrap_or(0);

    // `rdi`/`rsi` (System V) and `rcx`/`rdx` (Windows) carry the variable
    // and literal array base pointers for the whole function body, but
    // they're ordinary caller-saved GPRs in both ABIs: a callee like `sin`
    // or `pow` is free to clobber them. Reserve a fixed pair of slots to
    // save and restore them around every `Call`, only when the body
    // actually makes one.
    let has_call = instrs.iter().any(|i| matches!(i, Instr::Call { .. }));
    let call_save_bytes = if has_call { CALL_SAVE_BYTES } else { 0 };
    let reserved = stack_bytes + call_save_bytes;

    let mut code = Vec::new();
    let mut relocations = Vec::new();

    emit_prologue(&mut code, abi, reserved);

    for instr in instrs {
        match instr {
            Instr::StackAllocate { .. } | Instr::Return { .. } => {}
            Instr::LoadVariable { dst, offset } => {
                emit_load_mem(&mut code, *dst, abi.variable_base_ptr(), *offset)
            }
            Instr::LoadLiteral { dst, offset } => {
                emit_load_mem(&mut code, *dst, abi.literal_base_ptr(), *offset)
            }
            Instr::Move { dst, src } => emit_movsd_reg(&mut code, *dst, *src),
            Instr::Neg { dst } => emit_neg(&mut code, *dst, &mut relocations),
            Instr::BinOp { op, dst, rhs } => emit_binop(&mut code, *op, *dst, *rhs),
            Instr::Call { name, .. } => emit_call(&mut code, &mut relocations, abi, name),
            Instr::SpillStore { src, stack_offset } => emit_store_mem(
                &mut code,
                *src,
                GpRegister::Rsp,
                spill_displacement(abi, call_save_bytes, *stack_offset),
            ),
            Instr::ReloadLoad { dst, stack_offset } => emit_load_mem(
                &mut code,
                *dst,
                GpRegister::Rsp,
                spill_displacement(abi, call_save_bytes, *stack_offset),
            ),
        }
    }

    emit_epilogue(&mut code, abi, reserved);
    (code, relocations)
}

/// Two 8-byte slots, reserved right above the ABI's shadow space, holding
/// the variable/literal base pointers while a library call runs.
pub const CALL_SAVE_BYTES: u32 = 16;

/// Total stack the non-frame-pointer prologue reserves: spill slots, the
/// call-save slots, the ABI's shadow space, plus 8 bytes to keep `rsp`
/// 16-byte aligned at internal call sites (entry `rsp` is `16k + 8`; System
/// V absorbs the same 8 bytes via `push rbp` instead).
fn windows_frame_size(abi: &dyn Abi, reserved: u32) -> u32 {
    reserved + abi.shadow_space_bytes() + 8
}

/// Spill slots are addressed from `rsp`, but on Windows x64 the bottom
/// `shadow_space_bytes()` of the frame is space a callee is free to
/// scribble into, so a spilled value placed there could be corrupted by
/// the very next call. Bias every spill-slot displacement above it, and
/// above `emit_call`'s base-pointer save slots; `regalloc.rs` allocates
/// spill offsets starting at zero, ABI-agnostic.
fn spill_displacement(abi: &dyn Abi, call_save_bytes: u32, stack_offset: u64) -> u64 {
    stack_offset + abi.shadow_space_bytes() as u64 + call_save_bytes as u64
}

fn emit_prologue(code: &mut Vec<u8>, abi: &dyn Abi, reserved: u32) {
    if abi.uses_frame_pointer() {
        code.push(0x55); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        if reserved > 0 {
            code.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
            code.extend_from_slice(&reserved.to_le_bytes());
        }
    } else {
        let frame = windows_frame_size(abi, reserved);
        code.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
        code.extend_from_slice(&frame.to_le_bytes());
    }
}

fn emit_epilogue(code: &mut Vec<u8>, abi: &dyn Abi, reserved: u32) {
    if abi.uses_frame_pointer() {
        code.push(0xC9); // leave
    } else {
        let frame = windows_frame_size(abi, reserved);
        code.extend_from_slice(&[0x48, 0x81, 0xC4]); // add rsp, imm32
        code.extend_from_slice(&frame.to_le_bytes());
    }
    code.push(0xC3); // ret
}

/// ModR/M + (SIB if the base is `rsp`) + disp32 for a `[base + disp]`
/// memory operand. `disp32` is always used, even when a displacement
/// would fit in a byte, to sidestep the disp8/no-base special case that
/// `rbp`/`r13` trigger under `mod == 00`.
fn push_modrm_mem(code: &mut Vec<u8>, reg: u8, base_encoding: u8, disp: i32) {
    let modrm = 0x80 | ((reg & 0x7) << 3) | (base_encoding & 0x7);
    code.push(modrm);
    if base_encoding & 0x7 == 4 {
        code.push(0x24); // SIB: no index, base = rsp
    }
    code.extend_from_slice(&disp.to_le_bytes());
}

fn emit_load_mem(code: &mut Vec<u8>, dst: u32, base: GpRegister, offset: u64) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10]); // movsd xmm, [base+disp32]
    push_modrm_mem(code, dst as u8, base.encoding(), offset as i32);
}

fn emit_store_mem(code: &mut Vec<u8>, src: u32, base: GpRegister, offset: u64) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x11]); // movsd [base+disp32], xmm
    push_modrm_mem(code, src as u8, base.encoding(), offset as i32);
}

fn emit_movsd_reg(code: &mut Vec<u8>, dst: u32, src: u32) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10]); // movsd xmm, xmm
    code.push(0xC0 | ((dst as u8 & 0x7) << 3) | (src as u8 & 0x7));
}

fn emit_binop(code: &mut Vec<u8>, op: BinOp, dst: u32, rhs: u32) {
    let opcode = match op {
        BinOp::Add => 0x58, // addsd
        BinOp::Sub => 0x5C, // subsd
        BinOp::Mul => 0x59, // mulsd
        BinOp::Div => 0x5E, // divsd
    };
    code.extend_from_slice(&[0xF2, 0x0F, opcode]);
    code.push(0xC0 | ((dst as u8 & 0x7) << 3) | (rhs as u8 & 0x7));
}

/// `Neg` has no direct SSE2 instruction: load the sign-bit mask's address
/// into `rax`, then `xorpd` against it to flip the sign of `dst`'s low
/// qword.
fn emit_neg(code: &mut Vec<u8>, dst: u32, relocations: &mut Vec<Relocation>) {
    code.extend_from_slice(&[0x48, 0xB8]); // movabs rax, imm64
    let offset = code.len();
    code.extend_from_slice(&[0; 8]);
    relocations.push(Relocation {
        offset,
        kind: RelocationKind::Abs64,
        target: RelocationTarget::NegSignMask,
    });

    code.extend_from_slice(&[0x66, 0x0F, 0x57]); // xorpd xmm, [rax]
    code.push(((dst as u8 & 0x7) << 3) | GpRegister::Rax.encoding());
}

fn emit_gp_store_mem(code: &mut Vec<u8>, src: GpRegister, base: GpRegister, offset: u64) {
    code.push(0x48); // REX.W
    code.push(0x89); // mov [base+disp32], reg
    push_modrm_mem(code, src.encoding(), base.encoding(), offset as i32);
}

fn emit_gp_load_mem(code: &mut Vec<u8>, dst: GpRegister, base: GpRegister, offset: u64) {
    code.push(0x48); // REX.W
    code.push(0x8B); // mov reg, [base+disp32]
    push_modrm_mem(code, dst.encoding(), base.encoding(), offset as i32);
}

/// Library functions live in the host binary while compiled code runs from
/// a separately mapped page; the distance between the two routinely
/// exceeds the `call rel32`'s +-2GiB reach. Load the absolute address into
/// `rax` and call through it instead, mirroring `emit_neg`'s mask lookup.
///
/// The base pointers `abi.variable_base_ptr()`/`literal_base_ptr()` are
/// ordinary caller-saved GPRs in both ABIs (System V's `rdi`/`rsi`,
/// Windows's `rcx`/`rdx`), so a callee is free to overwrite them; every call
/// must save them to the reserved call-save slots first and restore them
/// once it returns. Pushing them instead would work on System V but would
/// shift `rsp` underneath Windows's shadow space and hand the callee
/// permission to scribble over the very values being saved, so both ABIs
/// use the same fixed-slot store/reload instead.
fn emit_call(code: &mut Vec<u8>, relocations: &mut Vec<Relocation>, abi: &dyn Abi, name: &str) {
    let variable_slot = abi.shadow_space_bytes() as u64;
    let literal_slot = variable_slot + 8;

    emit_gp_store_mem(code, abi.variable_base_ptr(), GpRegister::Rsp, variable_slot);
    emit_gp_store_mem(code, abi.literal_base_ptr(), GpRegister::Rsp, literal_slot);

    code.extend_from_slice(&[0x48, 0xB8]); // movabs rax, imm64
    let offset = code.len();
    code.extend_from_slice(&[0; 8]);
    relocations.push(Relocation {
        offset,
        kind: RelocationKind::Abs64,
        target: RelocationTarget::Function(name.to_string()),
    });

    code.extend_from_slice(&[0xFF, 0xD0]); // call rax

    emit_gp_load_mem(code, abi.variable_base_ptr(), GpRegister::Rsp, variable_slot);
    emit_gp_load_mem(code, abi.literal_base_ptr(), GpRegister::Rsp, literal_slot);
}

fn gp_name(reg: GpRegister) -> &'static str {
    match reg {
        GpRegister::Rax => "rax",
        GpRegister::Rcx => "rcx",
        GpRegister::Rdx => "rdx",
        GpRegister::Rsi => "rsi",
        GpRegister::Rdi => "rdi",
        GpRegister::Rbp => "rbp",
        GpRegister::Rsp => "rsp",
    }
}

fn binop_mnemonic(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "addsd",
        BinOp::Sub => "subsd",
        BinOp::Mul => "mulsd",
        BinOp::Div => "divsd",
    }
}

/// Render `instr` as a single Intel-syntax assembly line, for diagnostics
/// printed alongside (not instead of) the abstract `Instr` value.
/// `call_save_bytes` must be [`CALL_SAVE_BYTES`] if the surrounding
/// function makes any call, `0` otherwise, matching [`emit`]'s own choice.
pub fn disassemble(instr: &Instr, abi: &dyn Abi, call_save_bytes: u32) -> String {
    match instr {
        Instr::LoadVariable { dst, offset } => {
            format!("movsd xmm{dst}, [{}+{offset:#x}]", gp_name(abi.variable_base_ptr()))
        }
        Instr::LoadLiteral { dst, offset } => {
            format!("movsd xmm{dst}, [{}+{offset:#x}]", gp_name(abi.literal_base_ptr()))
        }
        Instr::Move { dst, src } => format!("movsd xmm{dst}, xmm{src}"),
        Instr::Neg { dst } => format!("xorpd xmm{dst}, [rip+neg_sign_mask]"),
        Instr::BinOp { op, dst, rhs } => format!("{} xmm{dst}, xmm{rhs}", binop_mnemonic(*op)),
        Instr::Call { name, dst, .. } => format!(
            "call {name}  ; saves/restores {}/{} across the call, -> xmm{dst}",
            gp_name(abi.variable_base_ptr()),
            gp_name(abi.literal_base_ptr())
        ),
        Instr::SpillStore { src, stack_offset } => format!(
            "movsd [rsp+{:#x}], xmm{src}",
            spill_displacement(abi, call_save_bytes, *stack_offset)
        ),
        Instr::ReloadLoad { dst, stack_offset } => format!(
            "movsd xmm{dst}, [rsp+{:#x}]",
            spill_displacement(abi, call_save_bytes, *stack_offset)
        ),
        Instr::StackAllocate { size } => format!("sub rsp, {size:#x}"),
        Instr::Return { src } => format!("ret  ; xmm{src}"),
    }
}

/// Worst-case number of bytes `instr` can lower to, computed from the
/// fixed byte sequences `emit` produces for each variant. Exact for every
/// variant except the two memory-operand forms whose base register isn't
/// always `rsp` (`LoadVariable`/`LoadLiteral`), where it overcounts by the
/// one SIB byte those bases never need.
pub fn get_bytecode_size_estimate(instr: &Instr) -> usize {
    const PREFIXED_MEM_OP: usize = 3 + 1 + 1 + 4; // prefix+opcode, modrm, SIB, disp32
    const GP_MEM_OP: usize = 1 + 1 + 1 + 1 + 4; // REX.W, opcode, modrm, SIB, disp32
    match instr {
        Instr::StackAllocate { .. } | Instr::Return { .. } => 0,
        Instr::LoadVariable { .. } | Instr::LoadLiteral { .. } => PREFIXED_MEM_OP,
        Instr::Move { .. } => 4,
        Instr::BinOp { .. } => 4,
        Instr::Neg { .. } => 10 + 4, // movabs rax,imm64 + xorpd xmm,[rax]
        // 2 GP stores + movabs rax,imm64 + call rax + 2 GP reloads, saving
        // the base pointers around the call.
        Instr::Call { .. } => 2 * GP_MEM_OP + 10 + 2 + 2 * GP_MEM_OP,
        Instr::SpillStore { .. } | Instr::ReloadLoad { .. } => PREFIXED_MEM_OP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{SystemV, WindowsX64};
    use crate::isel::select;
    use crate::lex::lex;
    use crate::parse::parse;
    use crate::regalloc::allocate;
    use crate::symtab::collect;
    use crate::ssa::build;

    fn emit_str(src: &str, abi: &dyn Abi) -> (Vec<u8>, Vec<Relocation>) {
        let tokens = lex(src).unwrap();
        let ast = parse(&tokens).unwrap();
        let symtable = collect(&ast).unwrap();
        let mut ssa = build(&ast, &symtable).unwrap();
        allocate(&mut ssa, abi).unwrap();
        let instrs = select(&ssa, &symtable, abi).unwrap();
        emit(&instrs, abi)
    }

    #[test]
    fn system_v_body_starts_with_push_rbp_and_ends_with_leave_ret() {
        let (code, _) = emit_str("a + b", &SystemV);
        assert_eq!(code[0], 0x55);
        assert_eq!(&code[code.len() - 2..], &[0xC9, 0xC3]);
    }

    #[test]
    fn windows_body_ends_with_add_rsp_and_ret() {
        let (code, _) = emit_str("a + b", &WindowsX64);
        // frame = 0 spill bytes + 32 shadow-space bytes + 8 alignment bytes = 40 (0x28).
        let tail = &code[code.len() - 8..];
        assert_eq!(tail, &[0x48, 0x81, 0xC4, 0x28, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn call_site_is_recorded_as_an_abs64_relocation() {
        // Library functions live in the host binary, outside the JIT page;
        // a `rel32` displacement routinely overflows that distance, so
        // calls must patch a full absolute address instead.
        let (_, relocs) = emit_str("sqrt(a)", &SystemV);
        assert!(relocs.iter().any(|r| matches!(
            (&r.kind, &r.target),
            (RelocationKind::Abs64, RelocationTarget::Function(name)) if name == "sqrt"
        )));
    }

    #[test]
    fn windows_spill_slots_sit_above_the_shadow_space() {
        let (code, _) = emit_str("a+(b+(c+(d+(e+(f+(g+(h+(i+j))))))))", &WindowsX64);
        // `emit_store_mem`'s disp32 is the last 4 bytes of its 9-byte
        // encoding (prefix, opcode, modrm, SIB, disp32). The allocator's
        // own offsets start at 0, so the smallest displacement any
        // `SpillStore` patches in must be exactly shadow_space_bytes() —
        // if the bias were missing, it would be 0 and overlap the space a
        // callee is free to scribble into.
        let min_disp = code
            .windows(3)
            .enumerate()
            .filter(|(_, w)| w[0] == 0xF2 && w[1] == 0x0F && w[2] == 0x11)
            .map(|(pos, _)| i32::from_le_bytes(code[pos + 5..pos + 9].try_into().unwrap()))
            .min()
            .expect("expression with 10 live variables must spill at least once");
        assert_eq!(min_disp, WindowsX64.shadow_space_bytes() as i32);
    }

    #[test]
    fn disassemble_names_call_targets_and_registers() {
        let instrs = {
            let tokens = lex("pow(a, b)").unwrap();
            let ast = parse(&tokens).unwrap();
            let symtable = collect(&ast).unwrap();
            let mut ssa = build(&ast, &symtable).unwrap();
            allocate(&mut ssa, &SystemV).unwrap();
            select(&ssa, &symtable, &SystemV).unwrap()
        };
        let lines: Vec<String> = instrs
            .iter()
            .map(|i| disassemble(i, &SystemV, CALL_SAVE_BYTES))
            .collect();
        assert!(lines.iter().any(|l| l.contains("call pow")));
        assert!(lines.iter().any(|l| l.starts_with("movsd xmm")));
    }

    #[test]
    fn size_estimate_never_undercounts_what_emit_produces() {
        let tokens = lex("(a + b) * (c - d) / pow(e, f)").unwrap();
        let ast = parse(&tokens).unwrap();
        let symtable = collect(&ast).unwrap();
        let mut ssa = build(&ast, &symtable).unwrap();
        allocate(&mut ssa, &SystemV).unwrap();
        let instrs = select(&ssa, &symtable, &SystemV).unwrap();
        let (code, _) = emit(&instrs, &SystemV);
        let estimated: usize = instrs.iter().map(get_bytecode_size_estimate).sum();
        // Fixed prologue/epilogue bytes aren't covered by the per-instruction
        // estimate; 16 bytes covers System V's worst case (push + mov rbp +
        // sub rsp, plus leave + ret).
        assert!(code.len() <= estimated + 16);
    }

    #[test]
    fn negation_emits_an_abs64_relocation_for_the_sign_mask() {
        let (_, relocs) = emit_str("-a", &SystemV);
        assert!(relocs
            .iter()
            .any(|r| matches!((&r.kind, &r.target), (RelocationKind::Abs64, RelocationTarget::NegSignMask))));
    }

    #[test]
    fn code_size_stays_within_a_generous_per_instruction_bound() {
        let tokens = lex("(a + b) * (c - d) / pow(e, f)").unwrap();
        let ast = parse(&tokens).unwrap();
        let symtable = collect(&ast).unwrap();
        let mut ssa = build(&ast, &symtable).unwrap();
        allocate(&mut ssa, &SystemV).unwrap();
        let instrs = select(&ssa, &symtable, &SystemV).unwrap();
        let (code, _) = emit(&instrs, &SystemV);
        // No abstract Instr lowers to more than 44 bytes (`Call`'s two
        // base-pointer saves, the movabs+call, and the two reloads); +16
        // covers the fixed prologue/epilogue overhead.
        assert!(code.len() <= instrs.len() * 44 + 16);
    }

    #[test]
    fn a_call_saves_and_restores_both_base_pointers() {
        // `pow` is free to clobber `rcx`/`rdx`, which hold the variable and
        // literal base pointers for the rest of the function; the call must
        // bracket itself with GP stores/reloads of both registers rather
        // than trusting them to survive. Windows's frame-pointer-free
        // prologue (just `sub rsp, imm32`) never emits a `0x48 0x89`/`0x48
        // 0x8B` pair of its own, unlike System V's `mov rbp, rsp`, so this
        // search can't collide with anything but the call's own saves.
        let (code, _) = emit_str("pow(a, b)", &WindowsX64);
        let store_count = code
            .windows(2)
            .filter(|w| w[0] == 0x48 && w[1] == 0x89)
            .count();
        let load_count = code
            .windows(2)
            .filter(|w| w[0] == 0x48 && w[1] == 0x8B)
            .count();
        assert_eq!(store_count, 2, "both base pointers must be saved before the call");
        assert_eq!(load_count, 2, "both base pointers must be reloaded after the call");
    }

    #[test]
    fn windows_call_save_slots_sit_above_the_shadow_space() {
        let (code, _) = emit_str("pow(a, b)", &WindowsX64);
        // The two GP stores saving `rcx`/`rdx` before the call must land
        // exactly at the shadow-space boundary, not inside it.
        let min_disp = code
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] == 0x48 && w[1] == 0x89)
            .map(|(pos, _)| i32::from_le_bytes(code[pos + 4..pos + 8].try_into().unwrap()))
            .min()
            .expect("a call must save at least one base pointer");
        assert_eq!(min_disp, WindowsX64.shadow_space_bytes() as i32);
    }
}

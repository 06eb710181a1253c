//! Machine backend: walks the typed AST and emits x86 / x86-64
//! instructions through the encoder into an object writer.
//!
//! One [`BackendSession`] covers a compilation unit; per-function state is
//! reset at every function boundary. All emission funnels through the
//! inline peephole optimizer.

mod expr;
mod peephole;
mod regalloc;
mod stmt;
mod vector;

use std::rc::Rc;

use indexmap::IndexMap;

use crate::ast::{Node, NodeKind};
use crate::encoder::regs::*;
use crate::encoder::{Bits, Cond, Encoder, Inst, Op, Operand, Reg, Size};
use crate::error::{CodegenError, CodegenResult};
use crate::obj::{ObjectWriter, SectionId, Storage};
use crate::target::{CompileOpts, Target};
use crate::types::CType;

use peephole::Peephole;
use regalloc::RegVar;

/// Hard cap on locals per function; exceeding it is a front-end bug.
const MAX_LOCALS: usize = 8192;

/// Where a local variable lives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Home {
    Stack(i32),
    Label(String),
    Reg(Reg),
}

#[derive(Debug, Clone)]
pub(crate) struct Local {
    pub name: String,
    pub ty: Rc<CType>,
    pub home: Home,
}

/// The last-value cache: when non-empty, the accumulator holds exactly
/// the value of the denoted location.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum AccCache {
    #[default]
    None,
    Stack(i32),
    Label(String),
    Reg(u8),
}

/// Break/continue frame: target label plus the stack cursor to restore
/// before jumping.
#[derive(Debug, Clone)]
pub(crate) struct LoopFrame {
    pub break_label: String,
    pub continue_label: Option<String>,
    pub stack_offset: i32,
    pub locals_len: usize,
}

/// One collected `case`/`default` of the innermost switch.
#[derive(Debug, Clone)]
pub(crate) struct SwitchCase {
    pub label: String,
    pub value: Option<i64>,
}

/// Per-switch side table replacing scratch stored on AST nodes: labels
/// are consumed by the case statements in collection order.
#[derive(Debug, Default)]
pub(crate) struct SwitchCtx {
    pub cases: Vec<SwitchCase>,
    pub next: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FuncState {
    pub name: String,
    pub ret_ty: Option<Rc<CType>>,
    pub end_label: String,
    /// Signed cursor, always <= 0, in bytes relative to the frame pointer.
    pub stack_offset: i32,
    pub locals: Vec<Local>,
    pub loops: Vec<LoopFrame>,
    pub switches: Vec<SwitchCtx>,
    pub acc: AccCache,
    pub acc_size: u32,
    pub reg_vars: Vec<RegVar>,
    /// Stack slot holding the hidden struct-return pointer.
    pub sret_offset: Option<i32>,
}

pub struct BackendSession {
    pub target: Target,
    pub opts: CompileOpts,
    pub obj: ObjectWriter,
    enc: Encoder,
    pub(crate) peep: Peephole,
    pub(crate) f: FuncState,
    label_count: u32,
    /// Interned string literals, flushed to `.data` at unit end.
    strings: Vec<(String, String)>,
    /// Interned float literals, flushed to `.data` at unit end.
    floats: Vec<(String, f64, bool)>,
    /// Global variable types, for identifier resolution.
    globals: IndexMap<String, Rc<CType>>,
    /// PGO counter site names, in allocation order.
    pgo_sites: Vec<String>,
}

impl BackendSession {
    pub fn new(target: Target, opts: CompileOpts) -> Self {
        let bits = if target.is_64() { Bits::B64 } else { Bits::B32 };
        let mut obj = ObjectWriter::new(target.machine());
        obj.source_file = opts.source_file.clone();
        obj.comp_dir = opts.comp_dir.clone();
        let peep = Peephole::new(opts.opt.gate() >= 1, opts.opt.gate(), opts.opt.prefer_size());
        BackendSession {
            target,
            opts,
            obj,
            enc: Encoder::new(bits),
            peep,
            f: FuncState::default(),
            label_count: 0,
            strings: Vec::new(),
            floats: Vec::new(),
            globals: IndexMap::new(),
            pgo_sites: Vec::new(),
        }
    }

    pub(crate) fn slot_size(&self) -> i32 {
        self.target.slot_size() as i32
    }

    pub(crate) fn is_64(&self) -> bool {
        self.target.is_64()
    }

    /// Accumulator at the target's native width.
    pub(crate) fn acc(&self) -> Reg {
        if self.is_64() {
            RAX
        } else {
            EAX
        }
    }

    /// Secondary scratch register.
    pub(crate) fn sec(&self) -> Reg {
        if self.is_64() {
            RCX
        } else {
            ECX
        }
    }

    /// Frame pointer.
    pub(crate) fn bp(&self) -> Reg {
        if self.is_64() {
            RBP
        } else {
            EBP
        }
    }

    pub(crate) fn sp(&self) -> Reg {
        if self.is_64() {
            RSP
        } else {
            ESP
        }
    }

    /// Operation width for a value of `ty`: pointers and 8-byte integers
    /// work at qword, everything narrower is promoted to dword.
    pub(crate) fn width_of(&self, ty: &CType) -> Size {
        if self.is_64() && ty.size_for(true) >= 8 {
            Size::Qword
        } else {
            Size::Dword
        }
    }

    pub(crate) fn type_size(&self, ty: &CType) -> u32 {
        ty.size_for(self.is_64())
    }

    pub(crate) fn new_label(&mut self, prefix: &str) -> String {
        let n = self.label_count;
        self.label_count += 1;
        format!("{}{}", prefix, n)
    }

    // ---- emission plumbing -------------------------------------------

    /// Emit through the peephole optimizer.
    pub(crate) fn emit(&mut self, inst: Inst) -> CodegenResult<()> {
        self.peep_feed(inst)
    }

    /// Encode immediately, bypassing the peephole buffers.
    pub(crate) fn emit_raw(&mut self, inst: Inst) -> CodegenResult<()> {
        self.enc.encode(&inst, &mut self.obj)
    }

    /// Define a text label at the current offset. Control can reach a
    /// label from elsewhere, so the accumulator cache dies here.
    pub(crate) fn emit_label(&mut self, name: &str) -> CodegenResult<()> {
        self.peep_label(name)?;
        self.obj.define_label(name, SectionId::Text, Storage::Static);
        self.f.acc = AccCache::None;
        Ok(())
    }

    pub(crate) fn invalidate_acc(&mut self) {
        self.f.acc = AccCache::None;
    }

    // ---- stack helpers -----------------------------------------------

    /// Push the accumulator as an expression temporary.
    pub(crate) fn push_acc(&mut self) -> CodegenResult<()> {
        let acc = self.acc();
        self.f.stack_offset -= self.slot_size();
        self.emit(Inst::new1(Op::Push, Operand::Reg(acc)))
    }

    /// Pop an expression temporary into the secondary register.
    pub(crate) fn pop_sec(&mut self) -> CodegenResult<()> {
        let sec = self.sec();
        self.f.stack_offset += self.slot_size();
        self.emit(Inst::new1(Op::Pop, Operand::Reg(sec)))
    }

    pub(crate) fn pop_reg(&mut self, reg: Reg) -> CodegenResult<()> {
        self.f.stack_offset += self.slot_size();
        self.emit(Inst::new1(Op::Pop, Operand::Reg(reg)))
    }

    /// Spill xmm0 to a fresh stack temporary.
    pub(crate) fn push_xmm(&mut self) -> CodegenResult<()> {
        let sp = self.sp();
        self.f.stack_offset -= 8;
        self.emit(Inst::new2(Op::Sub, Operand::Imm(8), Operand::Reg(sp)))?;
        self.emit(Inst::new2(
            Op::Movsd,
            Operand::Reg(XMM0),
            Operand::mem(sp, 0),
        ))
    }

    /// Reload a spilled xmm temporary into `reg`.
    pub(crate) fn pop_xmm(&mut self, reg: Reg) -> CodegenResult<()> {
        let sp = self.sp();
        self.f.stack_offset += 8;
        self.emit(Inst::new2(Op::Movsd, Operand::mem(sp, 0), Operand::Reg(reg)))?;
        self.emit(Inst::new2(Op::Add, Operand::Imm(8), Operand::Reg(sp)))
    }

    /// Allocate `size` bytes of stack (rounded up to the slot size) and
    /// return the new cursor offset.
    pub(crate) fn alloc_stack(&mut self, size: u32) -> CodegenResult<i32> {
        let slot = self.slot_size();
        let rounded = ((size as i32 + slot - 1) / slot) * slot;
        self.f.stack_offset -= rounded;
        let sp = self.sp();
        self.emit(Inst::new2(
            Op::Sub,
            Operand::Imm(rounded as i64),
            Operand::Reg(sp),
        ))?;
        Ok(self.f.stack_offset)
    }

    /// Materialize a stack-cursor restore with `lea off(%bp), %sp`.
    pub(crate) fn restore_stack_to(&mut self, offset: i32) -> CodegenResult<()> {
        if self.f.stack_offset != offset {
            let bp = self.bp();
            let sp = self.sp();
            self.emit(Inst::new2(Op::Lea, Operand::mem(bp, offset), Operand::Reg(sp)))?;
            self.f.stack_offset = offset;
        }
        Ok(())
    }

    /// Emit the restore without moving the compile-time cursor; used on
    /// paths that jump away (break/continue/case).
    pub(crate) fn restore_stack_for_jump(&mut self, offset: i32) -> CodegenResult<()> {
        if self.f.stack_offset != offset {
            let bp = self.bp();
            let sp = self.sp();
            self.emit(Inst::new2(Op::Lea, Operand::mem(bp, offset), Operand::Reg(sp)))?;
        }
        Ok(())
    }

    // ---- locals ------------------------------------------------------

    pub(crate) fn lookup_local(&self, name: &str) -> Option<&Local> {
        self.f.locals.iter().rev().find(|l| l.name == name)
    }

    /// Resolve an identifier: innermost local first, then the unit's
    /// globals.
    pub(crate) fn resolve_ident(&self, name: &str) -> Option<(Home, Rc<CType>)> {
        if let Some(local) = self.lookup_local(name) {
            return Some((local.home.clone(), local.ty.clone()));
        }
        self.globals
            .get(name)
            .map(|ty| (Home::Label(name.to_string()), ty.clone()))
    }

    pub(crate) fn add_local(&mut self, name: &str, ty: Rc<CType>, home: Home) -> CodegenResult<()> {
        if self.f.locals.len() >= MAX_LOCALS {
            return Err(CodegenError::LimitExceeded(format!(
                "more than {} locals in `{}`",
                MAX_LOCALS, self.f.name
            )));
        }
        self.f.locals.push(Local {
            name: name.to_string(),
            ty,
            home,
        });
        Ok(())
    }

    // ---- literals ----------------------------------------------------

    /// Intern a string literal and return its data label.
    pub(crate) fn intern_string(&mut self, value: &str) -> String {
        let label = self.new_label(".LC");
        self.strings.push((label.clone(), value.to_string()));
        label
    }

    /// Intern a float literal and return its data label.
    pub(crate) fn intern_float(&mut self, value: f64, is_double: bool) -> String {
        let label = self.new_label(".LF");
        self.floats.push((label.clone(), value, is_double));
        label
    }

    fn flush_literals(&mut self) {
        for (label, value) in std::mem::take(&mut self.strings) {
            self.obj
                .define_label(&label, SectionId::Data, Storage::Static);
            self.obj.data.write_bytes(value.as_bytes());
            self.obj.data.write_u8(0);
        }
        for (label, value, is_double) in std::mem::take(&mut self.floats) {
            self.obj.data.align_to(8);
            self.obj
                .define_label(&label, SectionId::Data, Storage::Static);
            if is_double {
                self.obj.data.write_u64(value.to_bits());
            } else {
                self.obj.data.write_u32((value as f32).to_bits());
            }
        }
    }

    // ---- PGO ---------------------------------------------------------

    pub(crate) fn pgo_enabled(&self) -> bool {
        self.opts.pgo_generate && self.is_64()
    }

    /// Allocate a named counter slot and emit the increment at the
    /// current site.
    pub(crate) fn pgo_count_site(&mut self, what: &str) -> CodegenResult<()> {
        if !self.pgo_enabled() {
            return Ok(());
        }
        let label = format!("__pgo_cnt_{}_{}_{}", self.f.name, what, self.pgo_sites.len());
        self.pgo_sites.push(label.clone());
        self.emit(Inst::new1(Op::Inc, Operand::label(label)).with_size(Size::Qword))
    }

    /// Emit the counter region and the `__pgo_dump` routine.
    fn flush_pgo(&mut self) -> CodegenResult<()> {
        if self.pgo_sites.is_empty() {
            return Ok(());
        }
        let count = self.pgo_sites.len() as u64;

        // Header blob followed by the contiguous counter region.
        self.obj.data.align_to(8);
        self.obj
            .define_label("__pgo_header", SectionId::Data, Storage::Static);
        self.obj.data.write_bytes(b"PGOC");
        self.obj.data.write_u32(1);
        self.obj.data.write_u64(count);
        self.obj
            .define_label("__pgo_counters", SectionId::Data, Storage::Static);
        for site in std::mem::take(&mut self.pgo_sites) {
            self.obj.define_label(&site, SectionId::Data, Storage::Static);
            self.obj.data.write_u64(0);
        }

        let path = self.intern_string("default.profdata");
        let mode = self.intern_string("wb");

        // int __pgo_dump(void): stream header + counters to the profile
        // file. Straight-line; the counter region is contiguous.
        self.obj.text.align_to(16);
        self.obj
            .define_label("__pgo_dump", SectionId::Text, Storage::External);
        self.emit_raw(Inst::new1(Op::Push, Operand::Reg(RBP)))?;
        self.emit_raw(Inst::new2(Op::Mov, Operand::Reg(RSP), Operand::Reg(RBP)))?;
        self.emit_raw(Inst::new2(Op::Sub, Operand::Imm(16), Operand::Reg(RSP)))?;
        let (a0, a1, a2, a3) = match self.target {
            Target::WindowsX64 => (RCX, RDX, R8, R9),
            _ => (RDI, RSI, RDX, RCX),
        };
        let skip = self.new_label(".Lpgo_skip");
        self.emit_raw(Inst::new2(Op::Lea, Operand::label(path), Operand::Reg(a0)))?;
        self.emit_raw(Inst::new2(Op::Lea, Operand::label(mode), Operand::Reg(a1)))?;
        if self.target == Target::WindowsX64 {
            self.emit_raw(Inst::new2(Op::Sub, Operand::Imm(32), Operand::Reg(RSP)))?;
        }
        self.emit_raw(Inst::new1(Op::Call, Operand::label("fopen")))?;
        if self.target == Target::WindowsX64 {
            self.emit_raw(Inst::new2(Op::Add, Operand::Imm(32), Operand::Reg(RSP)))?;
        }
        self.emit_raw(Inst::new2(Op::Mov, Operand::Reg(RAX), Operand::mem(RBP, -8)))?;
        self.emit_raw(Inst::new2(Op::Test, Operand::Reg(RAX), Operand::Reg(RAX)))?;
        self.emit_raw(Inst::new1(Op::Jcc(Cond::E), Operand::label(skip.clone())))?;
        for (region, size, nmemb) in [
            ("__pgo_header", 16i64, 1i64),
            ("__pgo_counters", 8, count as i64),
        ] {
            self.emit_raw(Inst::new2(Op::Lea, Operand::label(region), Operand::Reg(a0)))?;
            self.emit_raw(Inst::new2(Op::Mov, Operand::Imm(size), Operand::Reg(a1)))?;
            self.emit_raw(Inst::new2(Op::Mov, Operand::Imm(nmemb), Operand::Reg(a2)))?;
            self.emit_raw(Inst::new2(Op::Mov, Operand::mem(RBP, -8), Operand::Reg(a3)))?;
            if self.target == Target::WindowsX64 {
                self.emit_raw(Inst::new2(Op::Sub, Operand::Imm(32), Operand::Reg(RSP)))?;
            }
            self.emit_raw(Inst::new1(Op::Call, Operand::label("fwrite")))?;
            if self.target == Target::WindowsX64 {
                self.emit_raw(Inst::new2(Op::Add, Operand::Imm(32), Operand::Reg(RSP)))?;
            }
        }
        self.emit_raw(Inst::new2(Op::Mov, Operand::mem(RBP, -8), Operand::Reg(a0)))?;
        if self.target == Target::WindowsX64 {
            self.emit_raw(Inst::new2(Op::Sub, Operand::Imm(32), Operand::Reg(RSP)))?;
        }
        self.emit_raw(Inst::new1(Op::Call, Operand::label("fclose")))?;
        if self.target == Target::WindowsX64 {
            self.emit_raw(Inst::new2(Op::Add, Operand::Imm(32), Operand::Reg(RSP)))?;
        }
        self.obj
            .define_label(&skip, SectionId::Text, Storage::Static);
        self.emit_raw(Inst::new0(Op::Leave))?;
        self.emit_raw(Inst::new0(Op::Ret))?;
        Ok(())
    }

    // ---- functions ---------------------------------------------------

    /// Does `ty` return through a hidden pointer?
    pub(crate) fn returns_via_sret(&self, ty: Option<&Rc<CType>>) -> bool {
        match ty {
            Some(ty) => ty.is_aggregate() && self.type_size(ty) > self.slot_size() as u32,
            None => false,
        }
    }

    pub fn emit_function(&mut self, node: &Node) -> CodegenResult<()> {
        let (name, params, body, is_static) = match &node.kind {
            NodeKind::Function {
                name,
                params,
                body,
                is_static,
            } => (name, params, body, *is_static),
            _ => {
                return Err(CodegenError::Internal(
                    "emit_function expects a function node".into(),
                ))
            }
        };
        log::debug!("codegen function `{}`", name);

        self.f = FuncState {
            name: name.clone(),
            ret_ty: node.ty.clone(),
            end_label: String::new(),
            ..FuncState::default()
        };
        self.f.end_label = self.new_label(&format!(".Lend_{}_", name));
        self.peep.reset();

        self.obj.text.align_to(16);
        let entry = self.obj.text.len() as u32;
        self.obj.define_label(
            name,
            SectionId::Text,
            if is_static {
                Storage::Static
            } else {
                Storage::External
            },
        );

        if self.opts.debug_info {
            let (kind, size) = match &node.ty {
                Some(ty) => (ty.debug_kind(), self.type_size(ty)),
                None => (0, 0),
            };
            self.obj.begin_debug_func(name, entry, kind, size);
        }

        // Prologue.
        let bp = self.bp();
        let sp = self.sp();
        self.emit_raw(Inst::new1(Op::Push, Operand::Reg(bp)))?;
        self.emit_raw(Inst::new2(Op::Mov, Operand::Reg(sp), Operand::Reg(bp)))?;

        // Callee-saved promotion of hot scalars.
        if self.opts.opt.gate() >= 2 {
            self.f.reg_vars = regalloc::scan_function(self, params, body)?;
        }
        let reg_vars = self.f.reg_vars.clone();
        for rv in &reg_vars {
            self.f.stack_offset -= self.slot_size();
            self.emit_raw(Inst::new1(Op::Push, Operand::Reg(rv.reg)))?;
        }

        self.bind_params(params)?;
        self.pgo_count_site("entry")?;

        self.gen_stmt(body)?;

        // Fall-through return value is zero.
        let acc32 = self.acc().with_size(Size::Dword);
        self.emit(Inst::new2(Op::Xor, Operand::Reg(acc32), Operand::Reg(acc32)))?;
        self.restore_callee_saved()?;
        let end_label = self.f.end_label.clone();
        self.emit_label(&end_label)?;
        self.emit(Inst::new0(Op::Leave))?;
        self.emit(Inst::new0(Op::Ret))?;
        self.peep_flush()?;

        if self.opts.debug_info {
            let exit = self.obj.text.len() as u32;
            self.obj.end_debug_func(exit);
            self.obj.end_debug_sequence(exit);
        }
        Ok(())
    }

    /// Move incoming parameters to their homes.
    fn bind_params(&mut self, params: &[Node]) -> CodegenResult<()> {
        let slot = self.slot_size();
        let sret = self.returns_via_sret(self.f.ret_ty.as_ref());

        if !self.is_64() {
            // cdecl: parameters already sit above the saved frame pointer.
            let mut offset = 2 * slot;
            if sret {
                self.f.sret_offset = Some(offset);
                offset += slot;
            }
            for param in params {
                let (name, ty) = param_parts(param)?;
                self.add_local(name, ty.clone(), Home::Stack(offset))?;
                self.debug_param(name, &ty, offset);
                offset += ((self.type_size(&ty) as i32 + slot - 1) / slot).max(1) * slot;
            }
            return Ok(());
        }

        let int_regs = self.target.int_arg_regs().to_vec();
        let float_count = self.target.float_arg_count();
        let windows = self.target == Target::WindowsX64;
        // Windows assigns registers by argument position; SysV keeps
        // separate integer and XMM counters.
        let mut position = usize::from(sret);
        let mut int_slot = position;
        let mut float_slot = 0usize;

        if sret {
            // The hidden pointer occupies the first integer slot.
            let offset = self.alloc_stack(8)?;
            let reg = int_regs[0];
            self.emit(Inst::new2(Op::Mov, Operand::Reg(reg), Operand::mem(RBP, offset)))?;
            self.f.sret_offset = Some(offset);
        }

        // Overflow parameters: above return address and saved rbp, plus
        // the shadow area on Windows.
        let mut overflow = 16 + self.target.shadow_space() as i32;
        for param in params.iter() {
            let (name, ty) = param_parts(param)?;
            let is_float = ty.is_float();
            let reg_arg = if windows {
                let p = position;
                position += 1;
                if p >= int_regs.len() {
                    None
                } else if is_float {
                    Some(ParamReg::Xmm(p as u8))
                } else {
                    Some(ParamReg::Int(int_regs[p]))
                }
            } else if is_float {
                if float_slot < float_count {
                    float_slot += 1;
                    Some(ParamReg::Xmm((float_slot - 1) as u8))
                } else {
                    None
                }
            } else if int_slot < int_regs.len() {
                int_slot += 1;
                Some(ParamReg::Int(int_regs[int_slot - 1]))
            } else {
                None
            };

            match reg_arg {
                Some(ParamReg::Int(reg)) => {
                    // Promoted parameters move straight to their
                    // callee-saved register.
                    if let Some(rv) = self.f.reg_vars.iter().find(|rv| rv.name == *name) {
                        let target = rv.reg;
                        self.emit(Inst::new2(Op::Mov, Operand::Reg(reg), Operand::Reg(target)))?;
                        self.add_local(name, ty.clone(), Home::Reg(target))?;
                        self.debug_param(name, &ty, 0);
                        continue;
                    }
                    let offset = self.alloc_stack(8)?;
                    self.emit(Inst::new2(Op::Mov, Operand::Reg(reg), Operand::mem(RBP, offset)))?;
                    self.add_local(name, ty.clone(), Home::Stack(offset))?;
                    self.debug_param(name, &ty, offset);
                }
                Some(ParamReg::Xmm(id)) => {
                    let offset = self.alloc_stack(8)?;
                    let op = if self.type_size(&ty) == 4 {
                        Op::Movss
                    } else {
                        Op::Movsd
                    };
                    self.emit(Inst::new2(
                        op,
                        Operand::Reg(Reg::xmm(id)),
                        Operand::mem(RBP, offset),
                    ))?;
                    self.add_local(name, ty.clone(), Home::Stack(offset))?;
                    self.debug_param(name, &ty, offset);
                }
                None => {
                    self.add_local(name, ty.clone(), Home::Stack(overflow))?;
                    self.debug_param(name, &ty, overflow);
                    overflow += 8;
                }
            }
        }
        Ok(())
    }

    fn debug_param(&mut self, name: &str, ty: &Rc<CType>, offset: i32) {
        if self.opts.debug_info {
            self.obj.add_debug_var(
                name,
                offset,
                true,
                ty.debug_kind(),
                self.type_size(ty),
                ty.type_name(),
            );
        }
    }

    /// Restore promoted callee-saved registers from their save slots.
    pub(crate) fn restore_callee_saved(&mut self) -> CodegenResult<()> {
        let reg_vars = self.f.reg_vars.clone();
        let bp = self.bp();
        for rv in reg_vars.iter().rev() {
            self.emit(Inst::new2(
                Op::Mov,
                Operand::mem(bp, rv.save_offset),
                Operand::Reg(rv.reg),
            ))?;
        }
        Ok(())
    }

    // ---- globals -----------------------------------------------------

    pub fn emit_global(&mut self, node: &Node) -> CodegenResult<()> {
        let (name, is_static, is_extern, init) = match &node.kind {
            NodeKind::VarDecl {
                name,
                is_static,
                is_extern,
                init,
            } => (name.clone(), *is_static, *is_extern, init.as_deref()),
            _ => {
                return Err(CodegenError::Internal(
                    "emit_global expects a declaration".into(),
                ))
            }
        };
        let ty = node.type_or_int();
        self.globals.insert(name.clone(), ty.clone());
        if is_extern {
            return Ok(());
        }
        let storage = if is_static {
            Storage::Static
        } else {
            Storage::External
        };

        // Uninitialized globals go to .bss on ELF; COFF keeps zeroed
        // bytes in .data.
        if init.is_none() && self.target.is_elf() {
            let size = self.type_size(&ty).max(1) as u64;
            self.bss_align();
            self.obj.add_symbol(&name, self.obj.bss_size, SectionId::Bss, false, storage);
            self.obj.bss_size += size;
            return Ok(());
        }

        self.data_align(&ty);
        self.obj.define_label(&name, SectionId::Data, storage);
        self.emit_global_value(&ty, init, node.line)
    }

    fn bss_align(&mut self) {
        self.obj.bss_size = (self.obj.bss_size + 7) & !7;
    }

    fn data_align(&mut self, ty: &CType) {
        let align = self.type_size(ty).clamp(1, 8) as usize;
        self.obj.data.align_to(align.next_power_of_two());
    }

    /// Write one global's initializer bytes (or zeros) to `.data`.
    fn emit_global_value(
        &mut self,
        ty: &Rc<CType>,
        init: Option<&Node>,
        line: u32,
    ) -> CodegenResult<()> {
        let size = self.type_size(ty);
        match init {
            None => {
                for _ in 0..size.max(1) {
                    self.obj.data.write_u8(0);
                }
                Ok(())
            }
            Some(node) => self.emit_global_init(ty, node, line),
        }
    }

    fn emit_global_init(&mut self, ty: &Rc<CType>, init: &Node, line: u32) -> CodegenResult<()> {
        match (&init.kind, &**ty) {
            (NodeKind::IntLit(v), _) if ty.is_integer() || ty.is_pointer() => {
                self.write_scalar(self.type_size(ty), *v);
                Ok(())
            }
            (NodeKind::FloatLit(v), CType::Float) => {
                self.obj.data.write_u32((*v as f32).to_bits());
                Ok(())
            }
            (NodeKind::FloatLit(v), CType::Double) => {
                self.obj.data.write_u64(v.to_bits());
                Ok(())
            }
            // char arrays initialized from a string literal.
            (NodeKind::StrLit(s), CType::Array(elem, len)) if elem.size_for(true) == 1 => {
                self.obj.data.write_bytes(s.as_bytes());
                for _ in s.len()..*len {
                    self.obj.data.write_u8(0);
                }
                Ok(())
            }
            // Pointer to a string literal.
            (NodeKind::StrLit(s), CType::Pointer(_)) => {
                let label = self.intern_string(s);
                self.write_pointer_reloc(&label)
            }
            // &global emits a pointer-sized placeholder and an absolute
            // relocation against the referenced symbol.
            (NodeKind::Unary { op, expr }, CType::Pointer(_))
                if *op == crate::ast::UnaryOp::AddrOf =>
            {
                match &expr.kind {
                    NodeKind::Ident(target) => {
                        let target = target.clone();
                        self.write_pointer_reloc(&target)
                    }
                    _ => Err(CodegenError::Unsupported {
                        what: "non-constant address initializer".into(),
                        line,
                    }),
                }
            }
            (NodeKind::InitList(elems), CType::Array(elem, len)) => {
                let elem = elem.clone();
                let len = *len;
                for value in elems.iter().take(len) {
                    self.emit_global_init(&elem, value, line)?;
                }
                let elem_size = self.type_size(&elem);
                for _ in elems.len()..len {
                    for _ in 0..elem_size {
                        self.obj.data.write_u8(0);
                    }
                }
                Ok(())
            }
            (NodeKind::InitList(elems), CType::Struct { members, size, .. }) => {
                let members = members.clone();
                let size = *size;
                let mut written = 0u32;
                for (member, value) in members.iter().zip(elems.iter()) {
                    while written < member.offset {
                        self.obj.data.write_u8(0);
                        written += 1;
                    }
                    self.emit_global_init(&member.ty, value, line)?;
                    written += self.type_size(&member.ty);
                }
                while written < size {
                    self.obj.data.write_u8(0);
                    written += 1;
                }
                Ok(())
            }
            _ => Err(CodegenError::Unsupported {
                what: "global initializer form".into(),
                line,
            }),
        }
    }

    fn write_scalar(&mut self, size: u32, value: i64) {
        match size {
            1 => self.obj.data.write_u8(value as u8),
            2 => self.obj.data.write_u16(value as u16),
            4 => self.obj.data.write_u32(value as u32),
            _ => self.obj.data.write_u64(value as u64),
        }
    }

    fn write_pointer_reloc(&mut self, symbol: &str) -> CodegenResult<()> {
        let sym = self.obj.symbol_index_for(symbol);
        let offset = self.obj.data.len() as u64;
        if self.is_64() {
            self.obj.data.write_u64(0);
            self.obj
                .add_reloc(SectionId::Data, offset, sym, crate::obj::FixupKind::Addr64);
        } else {
            self.obj.data.write_u32(0);
            self.obj
                .add_reloc(SectionId::Data, offset, sym, crate::obj::FixupKind::Abs32);
        }
        Ok(())
    }

    /// Finish the unit: flush literals and PGO support, then serialize.
    pub fn finish(mut self) -> CodegenResult<Vec<u8>> {
        self.flush_pgo()?;
        self.flush_literals();
        if self.target.is_elf() {
            self.obj.write_elf()
        } else {
            self.obj.write_coff()
        }
    }
}

enum ParamReg {
    Int(Reg),
    Xmm(u8),
}

fn param_parts(param: &Node) -> CodegenResult<(&String, Rc<CType>)> {
    match &param.kind {
        NodeKind::VarDecl { name, .. } => Ok((name, param.type_or_int())),
        _ => Err(CodegenError::Internal(
            "function parameter is not a declaration".into(),
        )),
    }
}

/// Compile a typed unit to object file bytes.
pub fn compile_unit(nodes: &[Node], target: Target, opts: CompileOpts) -> CodegenResult<Vec<u8>> {
    let mut session = BackendSession::new(target, opts);
    for node in nodes {
        match &node.kind {
            NodeKind::Function { .. } => session.emit_function(node)?,
            NodeKind::VarDecl { .. } => session.emit_global(node)?,
            _ => {
                return Err(CodegenError::Unsupported {
                    what: "top-level construct".into(),
                    line: node.line,
                })
            }
        }
    }
    session.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::OptLevel;

    fn session(target: Target) -> BackendSession {
        let opts = CompileOpts {
            opt: OptLevel::O2,
            ..CompileOpts::default()
        };
        BackendSession::new(target, opts)
    }

    #[test]
    fn call_padding_reaches_sixteen_byte_alignment() {
        let mut s = session(Target::LinuxX64);
        for pushed in [0, 8, 16, 24] {
            for offset in [0, -8, -16, -24, -40] {
                s.f.stack_offset = offset;
                let pad = s.call_padding(pushed);
                // Absolute depth at the call must be divisible by 16.
                assert_eq!((-offset + pushed + pad) % 16, 0);
                assert!(pad < 16);
            }
        }
    }

    #[test]
    fn shadow_space_is_counted_on_windows() {
        let mut s = session(Target::WindowsX64);
        s.f.stack_offset = 0;
        let pad = s.call_padding(0);
        assert_eq!((pad + 32) % 16, 0);
    }

    #[test]
    fn stack_allocation_rounds_to_slots() {
        let mut s = session(Target::LinuxX64);
        let a = s.alloc_stack(1).unwrap();
        assert_eq!(a, -8);
        let b = s.alloc_stack(12).unwrap();
        assert_eq!(b, -24);
        let c = s.alloc_stack(16).unwrap();
        assert_eq!(c, -40);

        let mut s = session(Target::DosX86);
        let a = s.alloc_stack(1).unwrap();
        assert_eq!(a, -4);
        let b = s.alloc_stack(6).unwrap();
        assert_eq!(b, -12);
    }

    #[test]
    fn label_counter_is_unique_across_prefixes() {
        let mut s = session(Target::LinuxX64);
        let a = s.new_label(".L");
        let b = s.new_label(".LC");
        let c = s.new_label(".L");
        assert_ne!(a, c);
        assert_eq!(a, ".L0");
        assert_eq!(b, ".LC1");
        assert_eq!(c, ".L2");
    }
}

//! Inline peephole optimizer.
//!
//! State is carried across `emit` calls; every call first combines with or
//! flushes the pending pattern, then may buffer the new instruction.
//! Label definitions force a flush (in the fixed order: setcc chain,
//! push, jcc, jcc+jmp pair, jmp) and end any unreachable region.

use crate::encoder::regs::*;
use crate::encoder::{Cond, Inst, Op, Operand, Reg, Size};
use crate::error::CodegenResult;

use super::BackendSession;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pending {
    None,
    Jmp(Inst),
    Jcc(Inst),
    JccJmp(Inst, Inst),
    Push(Inst),
    Setcc1(Inst),
    Setcc2(Inst, Inst),
    Setcc3(Inst, Inst, Inst),
}

#[derive(Debug)]
pub(crate) struct Peephole {
    enabled: bool,
    gate: u8,
    prefer_size: bool,
    unreachable: bool,
    flushing: bool,
    pending: Pending,
}

impl Peephole {
    pub fn new(enabled: bool, gate: u8, prefer_size: bool) -> Self {
        Peephole {
            enabled,
            gate,
            prefer_size,
            unreachable: false,
            flushing: false,
            pending: Pending::None,
        }
    }

    pub fn reset(&mut self) {
        self.unreachable = false;
        self.flushing = false;
        self.pending = Pending::None;
    }
}

fn branch_target(inst: &Inst) -> Option<&str> {
    match inst.operands.first() {
        Some(Operand::Label(name)) => Some(name),
        _ => None,
    }
}

fn is_reg(operand: &Operand, reg: Reg) -> bool {
    matches!(operand, Operand::Reg(r) if *r == reg)
}

/// `setcc %al`?
fn is_setcc_al(inst: &Inst) -> Option<Cond> {
    match inst.op {
        Op::Setcc(cc) if inst.operands.len() == 1 && is_reg(&inst.operands[0], AL) => Some(cc),
        _ => None,
    }
}

/// `movzbl %al, %eax`?
fn is_movzx_al_eax(inst: &Inst) -> bool {
    inst.op == Op::Movzx(Size::Byte)
        && inst.operands.len() == 2
        && is_reg(&inst.operands[0], AL)
        && is_reg(&inst.operands[1], EAX)
}

/// `test %eax, %eax`?
fn is_test_eax(inst: &Inst) -> bool {
    inst.op == Op::Test
        && inst.operands.len() == 2
        && is_reg(&inst.operands[0], EAX)
        && is_reg(&inst.operands[1], EAX)
}

impl BackendSession {
    /// Feed one instruction into the peephole window.
    pub(crate) fn peep_feed(&mut self, inst: Inst) -> CodegenResult<()> {
        if !self.peep.enabled {
            return self.emit_raw(inst);
        }
        // Nothing after an unconditional jump is reachable until a label.
        if self.peep.unreachable {
            return Ok(());
        }

        // Try to extend the pending pattern.
        match (&self.peep.pending, &inst.op) {
            (Pending::Push(push), Op::Pop) => {
                let src = push.operands[0].clone();
                let dst = inst.operands[0].clone();
                self.peep.pending = Pending::None;
                if src != dst {
                    return self.peep_apply(Inst::new2(Op::Mov, src, dst));
                }
                return Ok(());
            }
            (Pending::Setcc1(_), _) if is_movzx_al_eax(&inst) => {
                let Pending::Setcc1(setcc) =
                    std::mem::replace(&mut self.peep.pending, Pending::None)
                else {
                    unreachable!()
                };
                self.peep.pending = Pending::Setcc2(setcc, inst);
                return Ok(());
            }
            (Pending::Setcc2(..), _) if is_test_eax(&inst) => {
                let Pending::Setcc2(setcc, movzx) =
                    std::mem::replace(&mut self.peep.pending, Pending::None)
                else {
                    unreachable!()
                };
                self.peep.pending = Pending::Setcc3(setcc, movzx, inst);
                return Ok(());
            }
            (Pending::Setcc3(setcc, _, _), Op::Jcc(outer)) => {
                // setCC %al; movzbl; test; jCC L collapses to a single
                // conditional jump on the original condition.
                let inner = is_setcc_al(setcc).expect("buffered setcc");
                let collapsed = match outer {
                    Cond::E | Cond::Z => Some(inner.invert()),
                    Cond::Ne | Cond::Nz => Some(inner),
                    _ => None,
                };
                if let Some(cc) = collapsed {
                    let target = inst.operands[0].clone();
                    self.peep.pending = Pending::Jcc(Inst::new1(Op::Jcc(cc), target));
                    return Ok(());
                }
            }
            (Pending::Jcc(_), Op::Jmp) if branch_target(&inst).is_some() => {
                let Pending::Jcc(jcc) = std::mem::replace(&mut self.peep.pending, Pending::None)
                else {
                    unreachable!()
                };
                self.peep.pending = Pending::JccJmp(jcc, inst);
                self.peep.unreachable = true;
                return Ok(());
            }
            _ => {}
        }

        self.peep_flush()?;
        self.peep_apply(inst)
    }

    /// Apply single-instruction rewrites, then either buffer the result
    /// or encode it.
    fn peep_apply(&mut self, inst: Inst) -> CodegenResult<()> {
        debug_assert!(self.peep.pending == Pending::None || self.peep.flushing);

        // Algebraic simplification.
        if let (op, Some(Operand::Imm(value)), Some(Operand::Reg(reg))) =
            (inst.op, inst.operands.first(), inst.operands.get(1))
        {
            let value = *value;
            let reg = *reg;
            match op {
                Op::Add | Op::Sub if value == 0 => return Ok(()),
                Op::Imul if inst.operands.len() == 2 => {
                    return self.reduce_imul(inst, value, reg);
                }
                Op::Cmp if value == 0 => {
                    return self.encode_or_buffer(Inst::new2(
                        Op::Test,
                        Operand::Reg(reg),
                        Operand::Reg(reg),
                    ));
                }
                _ => {}
            }
        }
        if inst.op == Op::Mov && inst.operands.len() == 2 && inst.operands[0] == inst.operands[1] {
            if matches!(inst.operands[0], Operand::Reg(_)) {
                return Ok(());
            }
        }

        self.encode_or_buffer(inst)
    }

    /// Integer multiply by a constant: rewrite the cheap cases.
    fn reduce_imul(&mut self, inst: Inst, value: i64, reg: Reg) -> CodegenResult<()> {
        match value {
            1 => Ok(()),
            0 => {
                let reg32 = reg.with_size(Size::Dword);
                self.encode_or_buffer(Inst::new2(Op::Xor, Operand::Reg(reg32), Operand::Reg(reg32)))
            }
            2 => self.encode_or_buffer(Inst::new2(Op::Add, Operand::Reg(reg), Operand::Reg(reg))),
            4 => self.encode_or_buffer(Inst::new2(Op::Shl, Operand::Imm(2), Operand::Reg(reg))),
            8 => self.encode_or_buffer(Inst::new2(Op::Shl, Operand::Imm(3), Operand::Reg(reg))),
            3 | 5 | 9 => self.encode_or_buffer(Inst::new2(
                Op::Lea,
                Operand::Sib {
                    base: reg,
                    index: reg,
                    scale: (value - 1) as u8,
                    disp: 0,
                },
                Operand::Reg(reg),
            )),
            6 | 7
                if self.peep.gate >= 2
                    && !self.peep.prefer_size
                    && reg.id == RAX.id
                    && reg.size == self.acc().size =>
            {
                // x6: tmp = 3r, r = 2*tmp. x7: tmp = 3r, r = r + 2*tmp.
                let tmp = self.sec();
                self.encode_or_buffer(Inst::new2(
                    Op::Lea,
                    Operand::Sib {
                        base: reg,
                        index: reg,
                        scale: 2,
                        disp: 0,
                    },
                    Operand::Reg(tmp),
                ))?;
                let second = if value == 6 {
                    Operand::Sib {
                        base: tmp,
                        index: tmp,
                        scale: 1,
                        disp: 0,
                    }
                } else {
                    Operand::Sib {
                        base: reg,
                        index: tmp,
                        scale: 2,
                        disp: 0,
                    }
                };
                self.encode_or_buffer(Inst::new2(Op::Lea, second, Operand::Reg(reg)))
            }
            _ => self.encode_or_buffer(inst),
        }
    }

    /// Buffer pattern-starting instructions; encode everything else.
    fn encode_or_buffer(&mut self, inst: Inst) -> CodegenResult<()> {
        if self.peep.flushing {
            return self.emit_raw(inst);
        }
        match inst.op {
            Op::Jmp if branch_target(&inst).is_some() => {
                self.peep.pending = Pending::Jmp(inst);
                self.peep.unreachable = true;
                Ok(())
            }
            Op::Jcc(_) if branch_target(&inst).is_some() => {
                self.peep.pending = Pending::Jcc(inst);
                Ok(())
            }
            Op::Push if matches!(inst.operands.first(), Some(Operand::Reg(r)) if r.is_gp()) => {
                self.peep.pending = Pending::Push(inst);
                Ok(())
            }
            Op::Setcc(_) if is_setcc_al(&inst).is_some() => {
                self.peep.pending = Pending::Setcc1(inst);
                Ok(())
            }
            _ => self.emit_raw(inst),
        }
    }

    /// Define a label: resolve branch-to-next patterns, then flush.
    pub(crate) fn peep_label(&mut self, name: &str) -> CodegenResult<()> {
        if self.peep.enabled {
            match std::mem::replace(&mut self.peep.pending, Pending::None) {
                Pending::Jmp(jmp) if branch_target(&jmp) == Some(name) => {}
                Pending::Jcc(jcc) if branch_target(&jcc) == Some(name) => {}
                Pending::JccJmp(jcc, jmp) => {
                    if branch_target(&jcc) == Some(name) {
                        // jcc L1; jmp L2; L1: -> j(inverse) L2
                        let Op::Jcc(cc) = jcc.op else { unreachable!() };
                        let target = jmp.operands[0].clone();
                        self.peep.flushing = true;
                        self.emit_raw(Inst::new1(Op::Jcc(cc.invert()), target))?;
                        self.peep.flushing = false;
                    } else {
                        self.peep.pending = Pending::JccJmp(jcc, jmp);
                        self.peep_flush()?;
                    }
                }
                pending => {
                    self.peep.pending = pending;
                    self.peep_flush()?;
                }
            }
            self.peep.unreachable = false;
        }
        Ok(())
    }

    /// Encode whatever is buffered, in the fixed flush order (setcc
    /// chain, push, jcc, jcc+jmp pair, jmp).
    pub(crate) fn peep_flush(&mut self) -> CodegenResult<()> {
        let pending = std::mem::replace(&mut self.peep.pending, Pending::None);
        if pending == Pending::None {
            return Ok(());
        }
        self.peep.flushing = true;
        let result = (|| -> CodegenResult<()> {
            match pending {
                Pending::None => {}
                Pending::Setcc1(a) => self.emit_raw(a)?,
                Pending::Setcc2(a, b) => {
                    self.emit_raw(a)?;
                    self.emit_raw(b)?;
                }
                Pending::Setcc3(a, b, c) => {
                    self.emit_raw(a)?;
                    self.emit_raw(b)?;
                    self.emit_raw(c)?;
                }
                Pending::Push(a) => self.emit_raw(a)?,
                Pending::Jcc(a) => self.emit_raw(a)?,
                Pending::JccJmp(a, b) => {
                    self.emit_raw(a)?;
                    self.emit_raw(b)?;
                }
                Pending::Jmp(a) => self.emit_raw(a)?,
            }
            Ok(())
        })();
        self.peep.flushing = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{CompileOpts, OptLevel, Target};

    fn session(opt: OptLevel) -> BackendSession {
        let opts = CompileOpts {
            opt,
            ..CompileOpts::default()
        };
        BackendSession::new(Target::LinuxX64, opts)
    }

    fn bytes(session: &BackendSession) -> &[u8] {
        session.obj.text.as_slice()
    }

    #[test]
    fn push_pop_collapses_to_mov() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Push, Operand::Reg(RAX))).unwrap();
        s.emit(Inst::new1(Op::Pop, Operand::Reg(RCX))).unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0x89, 0xc1]); // mov %rax, %rcx
    }

    #[test]
    fn push_pop_same_register_vanishes() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Push, Operand::Reg(RAX))).unwrap();
        s.emit(Inst::new1(Op::Pop, Operand::Reg(RAX))).unwrap();
        s.peep_flush().unwrap();
        assert!(bytes(&s).is_empty());
    }

    #[test]
    fn branch_to_next_is_dropped() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Jmp, Operand::label(".L0"))).unwrap();
        s.emit_label(".L0").unwrap();
        assert!(bytes(&s).is_empty());

        s.emit(Inst::new1(Op::Jcc(Cond::E), Operand::label(".L1")))
            .unwrap();
        s.emit_label(".L1").unwrap();
        assert!(bytes(&s).is_empty());
    }

    #[test]
    fn jcc_over_jmp_collapses_with_inverted_condition() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Jcc(Cond::E), Operand::label(".L1")))
            .unwrap();
        s.emit(Inst::new1(Op::Jmp, Operand::label(".L2"))).unwrap();
        s.emit_label(".L1").unwrap();
        s.peep_flush().unwrap();
        // jne .L2
        assert_eq!(&bytes(&s)[..2], [0x0f, 0x85]);
        assert_eq!(bytes(&s).len(), 6);
    }

    #[test]
    fn unreachable_code_after_jmp_is_suppressed() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Jmp, Operand::label(".Laway"))).unwrap();
        s.emit(Inst::new2(Op::Mov, Operand::Imm(1), Operand::Reg(EAX)))
            .unwrap();
        s.emit(Inst::new2(Op::Add, Operand::Imm(2), Operand::Reg(EAX)))
            .unwrap();
        s.emit_label(".Lother").unwrap();
        s.peep_flush().unwrap();
        // Only the jump survived.
        assert_eq!(bytes(&s)[0], 0xe9);
        assert_eq!(bytes(&s).len(), 5);
    }

    #[test]
    fn algebraic_identities() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Add, Operand::Imm(0), Operand::Reg(RAX)))
            .unwrap();
        s.emit(Inst::new2(Op::Sub, Operand::Imm(0), Operand::Reg(RAX)))
            .unwrap();
        s.emit(Inst::new2(Op::Imul, Operand::Imm(1), Operand::Reg(RAX)))
            .unwrap();
        s.emit(Inst::new2(Op::Mov, Operand::Reg(RAX), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert!(bytes(&s).is_empty());

        // cmp $0 becomes test.
        s.emit(Inst::new2(Op::Cmp, Operand::Imm(0), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0x85, 0xc0]);
    }

    #[test]
    fn multiply_strength_reduction() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(2), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0x01, 0xc0]); // add %rax, %rax

        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(4), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0xc1, 0xe0, 0x02]); // shl $2, %rax

        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(3), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        // lea (%rax,%rax,2), %rax
        assert_eq!(bytes(&s), [0x48, 0x8d, 0x04, 0x40]);

        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(0), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x31, 0xc0]); // xor %eax, %eax
    }

    #[test]
    fn two_lea_chain_only_at_o2() {
        let mut s = session(OptLevel::O2);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(6), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        // lea (%rax,%rax,2),%rcx; lea (%rcx,%rcx,1),%rax
        assert_eq!(
            bytes(&s),
            [0x48, 0x8d, 0x0c, 0x40, 0x48, 0x8d, 0x04, 0x09]
        );

        // At -O1 the multiply is kept.
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(6), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0x6b, 0xc0, 0x06]);

        // Size-preferring mode keeps it too.
        let mut s = session(OptLevel::Os);
        s.emit(Inst::new2(Op::Imul, Operand::Imm(7), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        assert_eq!(bytes(&s), [0x48, 0x6b, 0xc0, 0x07]);
    }

    #[test]
    fn setcc_chain_collapses_into_conditional_jump() {
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Setcc(Cond::L), Operand::Reg(AL)))
            .unwrap();
        s.emit(Inst::new2(
            Op::Movzx(Size::Byte),
            Operand::Reg(AL),
            Operand::Reg(EAX),
        ))
        .unwrap();
        s.emit(Inst::new2(Op::Test, Operand::Reg(EAX), Operand::Reg(EAX)))
            .unwrap();
        // `je` jumps when the setcc condition was false.
        s.emit(Inst::new1(Op::Jcc(Cond::E), Operand::label(".Lf")))
            .unwrap();
        s.peep_flush().unwrap();
        // jge .Lf
        assert_eq!(&bytes(&s)[..2], [0x0f, 0x8d]);
        assert_eq!(bytes(&s).len(), 6);

        // `jne` keeps the original condition.
        let mut s = session(OptLevel::O1);
        s.emit(Inst::new1(Op::Setcc(Cond::L), Operand::Reg(AL)))
            .unwrap();
        s.emit(Inst::new2(
            Op::Movzx(Size::Byte),
            Operand::Reg(AL),
            Operand::Reg(EAX),
        ))
        .unwrap();
        s.emit(Inst::new2(Op::Test, Operand::Reg(EAX), Operand::Reg(EAX)))
            .unwrap();
        s.emit(Inst::new1(Op::Jcc(Cond::Ne), Operand::label(".Lt")))
            .unwrap();
        s.peep_flush().unwrap();
        // jl .Lt
        assert_eq!(&bytes(&s)[..2], [0x0f, 0x8c]);
    }

    #[test]
    fn disabled_at_o0() {
        let mut s = session(OptLevel::O0);
        s.emit(Inst::new2(Op::Add, Operand::Imm(0), Operand::Reg(RAX)))
            .unwrap();
        s.peep_flush().unwrap();
        // The identity is kept verbatim.
        assert_eq!(bytes(&s), [0x48, 0x83, 0xc0, 0x00]);
    }
}

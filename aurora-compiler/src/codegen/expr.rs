//! Expression lowering, calls, and branch emission.

use super::*;
use aurora_asm::{Cond, RegisterId};

/// A resolved right-hand operand for the two-address ALU forms.
enum GpOperand {
    Imm(i32),
    Reg(RegisterId, bool),
}

impl CodeGen {
    // ---- type recovery (the validator has already proven the rules) ----

    pub(super) fn ty_of(&self, expr: &Expr) -> Result<Type, CompileError> {
        match &expr.kind {
            ExprKind::Int(_) => Ok(Type::Int),
            ExprKind::Float(_) => Ok(Type::Float),
            ExprKind::Bool(_) => Ok(Type::Bool),
            ExprKind::Str(_) => Ok(Type::Str),
            ExprKind::Input => Ok(Type::Int),
            ExprKind::Var(name) => match self.lookup(name) {
                Some(info) => Ok(info.ty.clone()),
                None => self
                    .shared
                    .get(name)
                    .map(|cell| cell.ty.clone())
                    .ok_or_else(|| Self::err(format!("unknown variable `{name}`"))),
            },
            ExprKind::Binary { op, lhs, .. } => {
                if op.is_comparison() || op.is_logical() {
                    Ok(Type::Bool)
                } else {
                    self.ty_of(lhs)
                }
            }
            ExprKind::Unary { op, operand } => match op {
                UnOp::Not => Ok(Type::Bool),
                _ => self.ty_of(operand),
            },
            ExprKind::Cast { ty, .. } => Ok(ty.clone()),
            ExprKind::Call { name, .. } => self
                .funcs
                .get(name)
                .and_then(|f| f.ret.clone())
                .ok_or_else(|| Self::err(format!("`{name}` used as a value"))),
            ExprKind::ArrayIndex { name, .. } => match self.lookup(name).map(|i| &i.ty) {
                Some(Type::Array(elem)) => Ok((**elem).clone()),
                _ => Err(Self::err(format!("`{name}` is not an array"))),
            },
            ExprKind::AtomicLoad(name) => self
                .shared
                .get(name)
                .map(|cell| cell.ty.clone())
                .ok_or_else(|| Self::err(format!("`{name}` is not shared"))),
            ExprKind::Spawn(_) => Ok(Type::Thread),
            ExprKind::ArrayLit(_) => Err(Self::err("array literal outside an initializer")),
        }
    }

    // ---- entry points used by statement lowering ----

    /// Evaluates an integer-bank expression into a fresh temporary.
    pub(super) fn eval_gp_temp(&mut self, expr: &Expr) -> Result<RegisterId, CompileError> {
        let temp = self.gp.allocate_temp()?;
        self.gen_into_gp(temp, expr)?;
        Ok(temp)
    }

    /// Evaluates a float expression into a fresh temporary.
    pub(super) fn eval_fp_temp(&mut self, expr: &Expr) -> Result<RegisterId, CompileError> {
        let temp = self.fp.allocate_temp()?;
        self.gen_into_xmm(temp, expr)?;
        Ok(temp)
    }

    // ---- integer bank ----

    fn gen_into_gp(&mut self, dst: RegisterId, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Int(v) => self.emit_int_imm(dst, *v),
            ExprKind::Bool(b) => self.manifest.push_instr(op::movi(dst, *b as i32)),
            ExprKind::Str(text) => {
                let label = self.intern_string(text);
                self.manifest.push_instr(op::mov_label(dst, label));
            }
            ExprKind::Var(name) => match self.lookup(name).cloned() {
                Some(info) => {
                    if info.array.is_some() {
                        return Err(Self::err(format!("array `{name}` used as a value")));
                    }
                    let reg = self.gp.get_variable(&info.key, &mut self.frame)?;
                    self.drain_spills();
                    self.manifest.push_instr(op::mov(dst, reg));
                }
                None => {
                    let cell = self
                        .shared
                        .get(name)
                        .ok_or_else(|| Self::err(format!("unknown variable `{name}`")))?;
                    self.manifest.push_instr(op::ld(dst, cell.label));
                }
            },
            ExprKind::Binary { op, lhs, rhs } if op.is_logical() => {
                self.gen_logical_value(dst, *op, lhs, rhs)?;
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                self.gen_comparison_value(dst, *op, lhs, rhs)?;
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.gen_into_gp(dst, lhs)?;
                let operand = self.gp_operand(rhs)?;
                self.emit_gp_binop(*op, dst, &operand)?;
                self.release_operand(operand);
            }
            ExprKind::Unary { op, operand } => {
                match op {
                    UnOp::Neg => {
                        self.gen_into_gp(dst, operand)?;
                        self.manifest.push_instr(op::muli(dst, -1));
                    }
                    UnOp::Not => {
                        self.gen_into_gp(dst, operand)?;
                        self.manifest.push_instr(op::xori(dst, 1));
                    }
                    UnOp::BitNot => {
                        self.gen_into_gp(dst, operand)?;
                        self.manifest.push_instr(op::not(dst));
                    }
                }
            }
            ExprKind::Cast { ty: Type::Int, expr: inner } => {
                let src = self.eval_fp_temp(inner)?;
                self.manifest.push_instr(op::cvtsd2si(dst, src));
                self.fp.release_temp(src);
            }
            ExprKind::Cast { ty, .. } => {
                return Err(Self::err(format!("cast to {ty} in integer context")))
            }
            ExprKind::Call { name, args } => {
                self.gen_call(name, args)?;
                self.manifest.push_instr(op::mov(dst, REG_RET));
            }
            ExprKind::Input => {
                self.manifest.push_instr(op::svc(ServiceCode::InputInt));
                self.manifest.push_instr(op::mov(dst, REG_RET));
            }
            ExprKind::Spawn(func) => {
                let label = self
                    .funcs
                    .get(func)
                    .map(|f| f.label)
                    .ok_or_else(|| Self::err(format!("spawn of unknown function `{func}`")))?;
                self.manifest.push_instr(op::spawn(dst, label));
            }
            ExprKind::AtomicLoad(name) => {
                let cell = self
                    .shared
                    .get(name)
                    .ok_or_else(|| Self::err(format!("`{name}` is not shared")))?;
                self.manifest.push_instr(op::atomic_load(dst, cell.label));
            }
            ExprKind::ArrayIndex { name, index } => {
                let info = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| Self::err(format!("unknown array `{name}`")))?;
                let array = info
                    .array
                    .ok_or_else(|| Self::err(format!("`{name}` is not an array")))?;
                // The index lands in `dst` and the load overwrites it,
                // keeping nested indexing off the temporary pair.
                self.gen_into_gp(dst, index)?;
                self.manifest
                    .push_instr(op::array_load(dst, array.base_slot, dst));
            }
            ExprKind::Float(_) => {
                return Err(Self::err("float literal in integer context"))
            }
            ExprKind::ArrayLit(_) => {
                return Err(Self::err("array literal outside an initializer"))
            }
        }
        Ok(())
    }

    fn emit_int_imm(&mut self, dst: RegisterId, value: i64) {
        match i32::try_from(value) {
            Ok(v) => self.manifest.push_instr(op::movi(dst, v)),
            Err(_) => self.manifest.push_instr(op::movi64(dst, value)),
        }
    }

    /// Short-circuit `&&`/`||` producing a 0/1 value.
    fn gen_logical_value(
        &mut self,
        dst: RegisterId,
        op_: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let end = self.fresh_label("sc");
        self.gen_into_gp(dst, lhs)?;
        self.manifest.push_instr(op::cmpi(dst, 0));
        self.flush();
        let cond = match op_ {
            // `a || b`: a nonzero decides the result.
            BinOp::Or => Cond::Ne,
            // `a && b`: a zero decides the result.
            _ => Cond::Eq,
        };
        self.manifest.push_instr(op::cjmp(cond, end));
        self.gen_into_gp(dst, rhs)?;
        self.place(end);
        Ok(())
    }

    fn gen_comparison_value(
        &mut self,
        dst: RegisterId,
        op_: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let cond = comparison_cond(op_);
        let end = self.fresh_label("cmp");
        if self.ty_of(lhs)?.is_float() {
            let l = self.eval_fp_temp(lhs)?;
            let r = self.eval_fp_temp(rhs)?;
            self.manifest.push_instr(op::fcmp(l, r));
            self.fp.release_temp(r);
            self.fp.release_temp(l);
        } else {
            self.gen_into_gp(dst, lhs)?;
            let operand = self.gp_operand(rhs)?;
            match &operand {
                GpOperand::Imm(v) => self.manifest.push_instr(op::cmpi(dst, *v)),
                GpOperand::Reg(reg, _) => self.manifest.push_instr(op::cmp(dst, *reg)),
            }
            self.release_operand(operand);
        }
        // Moves and spill stores leave the compare flags intact.
        self.manifest.push_instr(op::movi(dst, 1));
        self.flush();
        self.manifest.push_instr(op::cjmp(cond, end));
        self.manifest.push_instr(op::movi(dst, 0));
        self.place(end);
        Ok(())
    }

    fn gp_operand(&mut self, expr: &Expr) -> Result<GpOperand, CompileError> {
        match &expr.kind {
            ExprKind::Int(v) => {
                if let Ok(v) = i32::try_from(*v) {
                    return Ok(GpOperand::Imm(v));
                }
            }
            ExprKind::Bool(b) => return Ok(GpOperand::Imm(*b as i32)),
            ExprKind::Var(name) => {
                if let Some(info) = self.lookup(name).cloned() {
                    if info.array.is_none() && !info.ty.is_float() {
                        let reg = self.gp.get_variable(&info.key, &mut self.frame)?;
                        self.drain_spills();
                        return Ok(GpOperand::Reg(reg, false));
                    }
                }
            }
            _ => {}
        }
        let temp = self.eval_gp_temp(expr)?;
        Ok(GpOperand::Reg(temp, true))
    }

    fn release_operand(&mut self, operand: GpOperand) {
        if let GpOperand::Reg(reg, true) = operand {
            self.gp.release_temp(reg);
        }
    }

    fn emit_gp_binop(
        &mut self,
        op_: BinOp,
        dst: RegisterId,
        operand: &GpOperand,
    ) -> Result<(), CompileError> {
        let instr = match operand {
            GpOperand::Imm(v) => match op_ {
                BinOp::Add => op::addi(dst, *v),
                BinOp::Sub => op::subi(dst, *v),
                BinOp::Mul => op::muli(dst, *v),
                BinOp::Div => op::divi(dst, *v),
                BinOp::Rem => op::remi(dst, *v),
                BinOp::BitAnd => op::andi(dst, *v),
                BinOp::BitOr => op::ori(dst, *v),
                BinOp::BitXor => op::xori(dst, *v),
                BinOp::Shl => op::shli(dst, *v),
                BinOp::Shr => op::shri(dst, *v),
                other => return Err(Self::err(format!("{other:?} is not an ALU operator"))),
            },
            GpOperand::Reg(reg, _) => match op_ {
                BinOp::Add => op::add(dst, *reg),
                BinOp::Sub => op::sub(dst, *reg),
                BinOp::Mul => op::mul(dst, *reg),
                BinOp::Div => op::div(dst, *reg),
                BinOp::Rem => op::rem(dst, *reg),
                BinOp::BitAnd => op::and(dst, *reg),
                BinOp::BitOr => op::or(dst, *reg),
                BinOp::BitXor => op::xor(dst, *reg),
                BinOp::Shl => op::shl(dst, *reg),
                BinOp::Shr => op::shr(dst, *reg),
                other => return Err(Self::err(format!("{other:?} is not an ALU operator"))),
            },
        };
        self.manifest.push_instr(instr);
        Ok(())
    }

    // ---- float bank ----

    fn gen_into_xmm(&mut self, dst: RegisterId, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Float(v) => self.manifest.push_instr(op::fmovi(dst, *v)),
            ExprKind::Var(name) => match self.lookup(name).cloned() {
                Some(info) => {
                    let reg = self.fp.get_variable(&info.key, &mut self.frame)?;
                    self.drain_spills();
                    self.manifest.push_instr(op::fmov(dst, reg));
                }
                None => {
                    let cell = self
                        .shared
                        .get(name)
                        .ok_or_else(|| Self::err(format!("unknown variable `{name}`")))?;
                    self.manifest.push_instr(op::ld(dst, cell.label));
                }
            },
            ExprKind::Binary { op: op_, lhs, rhs } => {
                self.gen_into_xmm(dst, lhs)?;
                let rhs_reg = self.eval_fp_temp(rhs)?;
                let instr = match op_ {
                    BinOp::Add => op::fadd(dst, rhs_reg),
                    BinOp::Sub => op::fsub(dst, rhs_reg),
                    BinOp::Mul => op::fmul(dst, rhs_reg),
                    BinOp::Div => op::fdiv(dst, rhs_reg),
                    other => {
                        return Err(Self::err(format!("{other:?} is not a float operator")))
                    }
                };
                self.manifest.push_instr(instr);
                self.fp.release_temp(rhs_reg);
            }
            ExprKind::Unary { op: UnOp::Neg, operand } => {
                self.gen_into_xmm(dst, operand)?;
                let minus_one = self.fp.allocate_temp()?;
                self.manifest.push_instr(op::fmovi(minus_one, -1.0));
                self.manifest.push_instr(op::fmul(dst, minus_one));
                self.fp.release_temp(minus_one);
            }
            ExprKind::Cast { ty: Type::Float, expr: inner } => {
                let src = self.eval_gp_temp(inner)?;
                self.manifest.push_instr(op::cvtsi2sd(dst, src));
                self.gp.release_temp(src);
            }
            ExprKind::Call { name, args } => {
                self.gen_call(name, args)?;
                self.manifest.push_instr(op::fmov(dst, 0));
            }
            ExprKind::AtomicLoad(name) => {
                let cell = self
                    .shared
                    .get(name)
                    .ok_or_else(|| Self::err(format!("`{name}` is not shared")))?;
                self.manifest.push_instr(op::atomic_load(dst, cell.label));
            }
            other => {
                return Err(Self::err(format!(
                    "expression {other:?} in float context"
                )))
            }
        }
        Ok(())
    }

    // ---- calls ----

    /// Lowers a call: arguments staged through dedicated slots, live
    /// temporaries saved, both banks flushed, arguments loaded into
    /// `r1..r5`/`xmm1..xmm5`, result in `r0`/`xmm0`.
    pub(super) fn gen_call(&mut self, name: &str, args: &[Expr]) -> Result<(), CompileError> {
        let fn_label = self
            .funcs
            .get(name)
            .map(|f| f.label)
            .ok_or_else(|| Self::err(format!("call to unknown function `{name}`")))?;

        let mut staged: Vec<(u32, RegisterId, bool)> = Vec::new();
        let mut int_idx = 0u8;
        let mut float_idx = 0u8;
        for arg in args {
            if self.ty_of(arg)?.is_float() {
                float_idx += 1;
                if float_idx > 5 {
                    return Err(Self::err(format!("too many float arguments to `{name}`")));
                }
                let temp = self.eval_fp_temp(arg)?;
                let slot = self.frame.reserve();
                self.manifest.push_instr(op::store_stack_f(slot, temp));
                self.fp.release_temp(temp);
                staged.push((slot, float_idx, true));
            } else {
                int_idx += 1;
                if int_idx > 5 {
                    return Err(Self::err(format!("too many arguments to `{name}`")));
                }
                let temp = self.eval_gp_temp(arg)?;
                let slot = self.frame.reserve();
                self.manifest.push_instr(op::store_stack(slot, temp));
                self.gp.release_temp(temp);
                staged.push((slot, int_idx, false));
            }
        }

        // In-flight expression temporaries survive the call in slots of
        // their own.
        let mut saved: Vec<(u32, RegisterId, bool)> = Vec::new();
        for temp in self.gp.temps_in_use() {
            let slot = self.frame.reserve();
            self.manifest.push_instr(op::store_stack(slot, temp));
            saved.push((slot, temp, false));
        }
        for temp in self.fp.temps_in_use() {
            let slot = self.frame.reserve();
            self.manifest.push_instr(op::store_stack_f(slot, temp));
            saved.push((slot, temp, true));
        }

        self.flush();

        for (slot, target, float) in &staged {
            let instr = if *float {
                op::load_stack_f(*target, *slot)
            } else {
                op::load_stack(*target, *slot)
            };
            self.manifest.push_instr(instr);
        }

        self.manifest.push_instr(op::call(fn_label));

        for (slot, temp, float) in &saved {
            let instr = if *float {
                op::load_stack_f(*temp, *slot)
            } else {
                op::load_stack(*temp, *slot)
            };
            self.manifest.push_instr(instr);
        }
        Ok(())
    }

    // ---- branches ----

    /// Jumps to `target` when `cond` is false. Registers are flushed
    /// between the compare and the jump, so every branch target is a
    /// clean point.
    pub(super) fn branch_false(
        &mut self,
        cond: &Expr,
        target: LabelId,
    ) -> Result<(), CompileError> {
        match &cond.kind {
            ExprKind::Binary { op: op_, lhs, rhs } if op_.is_comparison() => {
                let jump = comparison_cond(*op_).negate();
                self.emit_compare(lhs, rhs)?;
                self.flush();
                self.manifest.push_instr(op::cjmp(jump, target));
            }
            ExprKind::Binary {
                op: BinOp::And,
                lhs,
                rhs,
            } => {
                self.branch_false(lhs, target)?;
                self.branch_false(rhs, target)?;
            }
            ExprKind::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
            } => {
                let stay = self.fresh_label("or");
                self.branch_true(lhs, stay)?;
                self.branch_false(rhs, target)?;
                self.place(stay);
            }
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => self.branch_true(operand, target)?,
            _ => {
                let temp = self.eval_gp_temp(cond)?;
                self.manifest.push_instr(op::cmpi(temp, 0));
                self.gp.release_temp(temp);
                self.flush();
                self.manifest.push_instr(op::cjmp(Cond::Eq, target));
            }
        }
        Ok(())
    }

    /// Jumps to `target` when `cond` is true.
    pub(super) fn branch_true(
        &mut self,
        cond: &Expr,
        target: LabelId,
    ) -> Result<(), CompileError> {
        match &cond.kind {
            ExprKind::Binary { op: op_, lhs, rhs } if op_.is_comparison() => {
                let jump = comparison_cond(*op_);
                self.emit_compare(lhs, rhs)?;
                self.flush();
                self.manifest.push_instr(op::cjmp(jump, target));
            }
            ExprKind::Binary {
                op: BinOp::And,
                lhs,
                rhs,
            } => {
                let stay = self.fresh_label("and");
                self.branch_false(lhs, stay)?;
                self.branch_true(rhs, target)?;
                self.place(stay);
            }
            ExprKind::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
            } => {
                self.branch_true(lhs, target)?;
                self.branch_true(rhs, target)?;
            }
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => self.branch_false(operand, target)?,
            _ => {
                let temp = self.eval_gp_temp(cond)?;
                self.manifest.push_instr(op::cmpi(temp, 0));
                self.gp.release_temp(temp);
                self.flush();
                self.manifest.push_instr(op::cjmp(Cond::Ne, target));
            }
        }
        Ok(())
    }

    /// Emits `CMP`/`FCMP` for a comparison's operands.
    fn emit_compare(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        if self.ty_of(lhs)?.is_float() {
            let l = self.eval_fp_temp(lhs)?;
            let r = self.eval_fp_temp(rhs)?;
            self.manifest.push_instr(op::fcmp(l, r));
            self.fp.release_temp(r);
            self.fp.release_temp(l);
        } else {
            let l = self.eval_gp_temp(lhs)?;
            let operand = self.gp_operand(rhs)?;
            match &operand {
                GpOperand::Imm(v) => self.manifest.push_instr(op::cmpi(l, *v)),
                GpOperand::Reg(reg, _) => self.manifest.push_instr(op::cmp(l, *reg)),
            }
            self.release_operand(operand);
            self.gp.release_temp(l);
        }
        Ok(())
    }
}

fn comparison_cond(op: BinOp) -> Cond {
    match op {
        BinOp::Eq => Cond::Eq,
        BinOp::Ne => Cond::Ne,
        BinOp::Lt => Cond::Lt,
        BinOp::Le => Cond::Le,
        BinOp::Gt => Cond::Gt,
        BinOp::Ge => Cond::Ge,
        _ => unreachable!("not a comparison"),
    }
}

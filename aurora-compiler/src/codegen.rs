//! IR to MISA lowering.
//!
//! Registers are reassigned per statement; every label is a clean point
//! where both register banks have been flushed to their spill slots, so
//! control-flow merges never see diverging register assignments. The
//! spill stores a flush emits lower to plain moves and therefore sit
//! harmlessly between a compare and its conditional jump.

use std::collections::HashMap;

use aurora_asm::{op, Directive, LabelId, Manifest, ServiceCode, SharedType, Word, REG_RET};
use tracing::debug;

use crate::error::CompileError;
use crate::ir::*;
use crate::regalloc::{FrameSlots, RegisterFile};

mod expr;

/// Lowers a validated program to its manifest.
pub fn generate(program: &Program) -> Result<Manifest, CompileError> {
    CodeGen::new(program)?.run(program)
}

struct SharedCell {
    label: LabelId,
    ty: Type,
}

struct FnInfo {
    label: LabelId,
    ret: Option<Type>,
}

#[derive(Clone)]
struct ArrayInfo {
    base_slot: u32,
}

#[derive(Clone)]
struct VarInfo {
    ty: Type,
    /// Scope-unique key used inside the register allocator, so
    /// shadowing declarations never collide.
    key: String,
    array: Option<ArrayInfo>,
}

struct LoopCtx {
    continue_to: LabelId,
    break_to: LabelId,
}

struct CodeGen {
    manifest: Manifest,
    gp: RegisterFile,
    fp: RegisterFile,
    frame: FrameSlots,
    shared: HashMap<String, SharedCell>,
    funcs: HashMap<String, FnInfo>,
    scopes: Vec<HashMap<String, VarInfo>>,
    strings: Vec<(LabelId, Vec<u8>)>,
    interned: HashMap<Vec<u8>, LabelId>,
    loops: Vec<LoopCtx>,
    in_main: bool,
    next_label: u32,
    next_var: u32,
}

impl CodeGen {
    fn new(program: &Program) -> Result<Self, CompileError> {
        let mut manifest = Manifest::new("misa64");
        manifest.org = 0;

        let mut shared = HashMap::new();
        for decl in &program.shared {
            let label = manifest.fresh_label(format!("shared_{}", decl.name));
            shared.insert(
                decl.name.clone(),
                SharedCell {
                    label,
                    ty: decl.ty.clone(),
                },
            );
        }

        let mut funcs = HashMap::new();
        for f in &program.functions {
            let name = if f.name == "main" {
                "main".to_owned()
            } else {
                format!("fn_{}", f.name)
            };
            let label = manifest.fresh_label(name);
            funcs.insert(
                f.name.clone(),
                FnInfo {
                    label,
                    ret: f.ret.clone(),
                },
            );
        }

        Ok(Self {
            manifest,
            gp: RegisterFile::gp(),
            fp: RegisterFile::xmm(),
            frame: FrameSlots::new(),
            shared,
            funcs,
            scopes: Vec::new(),
            strings: Vec::new(),
            interned: HashMap::new(),
            loops: Vec::new(),
            in_main: false,
            next_label: 0,
            next_var: 0,
        })
    }

    fn run(mut self, program: &Program) -> Result<Manifest, CompileError> {
        for f in &program.functions {
            self.gen_function(f)?;
        }
        self.emit_data(program)?;
        Ok(self.manifest)
    }

    // ---- plumbing ----

    fn err(message: impl Into<String>) -> CompileError {
        CompileError::Codegen(message.into())
    }

    fn fresh_label(&mut self, hint: &str) -> LabelId {
        let n = self.next_label;
        self.next_label += 1;
        self.manifest.fresh_label(format!("L{n}_{hint}"))
    }

    /// Drains queued spill/reload instructions from both banks into the
    /// stream. Must run after every allocator interaction and before
    /// the instruction that needed the register.
    fn drain_spills(&mut self) {
        for instr in self.gp.take_spills() {
            self.manifest.push_instr(instr);
        }
        for instr in self.fp.take_spills() {
            self.manifest.push_instr(instr);
        }
    }

    /// Flushes both banks so every variable lives in its spill slot.
    fn flush(&mut self) {
        self.gp.spill_all(&mut self.frame);
        self.fp.spill_all(&mut self.frame);
        self.drain_spills();
    }

    /// Places a label at a clean point (all registers flushed first).
    fn place(&mut self, label: LabelId) {
        self.flush();
        self.manifest.place_label(label);
    }

    fn lookup(&self, name: &str) -> Option<&VarInfo> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn declare(&mut self, name: &str, ty: Type, array: Option<ArrayInfo>) -> VarInfo {
        let key = format!("{name}#{}", self.next_var);
        self.next_var += 1;
        let info = VarInfo {
            ty,
            key,
            array,
        };
        self.scopes
            .last_mut()
            .expect("inside a function")
            .insert(name.to_owned(), info.clone());
        info
    }

    fn intern_string(&mut self, text: &str) -> LabelId {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        if let Some(&label) = self.interned.get(&bytes) {
            return label;
        }
        let label = self
            .manifest
            .fresh_label(format!("str{}", self.strings.len()));
        self.interned.insert(bytes.clone(), label);
        self.strings.push((label, bytes));
        label
    }

    // ---- functions ----

    fn gen_function(&mut self, f: &FunctionDecl) -> Result<(), CompileError> {
        debug!(function = %f.name, "lowering");

        self.gp.reset();
        self.fp.reset();
        self.frame.reset();
        self.loops.clear();
        self.in_main = f.name == "main";
        self.scopes = vec![HashMap::new()];

        let label = self.funcs[&f.name].label;
        self.manifest.place_label(label);

        let mut int_args = 0u8;
        let mut float_args = 0u8;
        for param in &f.params {
            let info = self.declare(&param.name, param.ty.clone(), None);
            if param.ty.is_float() {
                float_args += 1;
                if float_args > 5 {
                    return Err(Self::err(format!(
                        "function `{}` has more than five float parameters",
                        f.name
                    )));
                }
                self.fp.bind(&info.key, float_args);
            } else {
                int_args += 1;
                if int_args > 5 {
                    return Err(Self::err(format!(
                        "function `{}` has more than five parameters",
                        f.name
                    )));
                }
                self.gp.bind(&info.key, int_args);
            }
        }

        self.gen_block(&f.body)?;

        // Fall-off-the-end path, skipped after an explicit terminator.
        let terminated = matches!(
            self.manifest.directives.last(),
            Some(Directive::Instr(i))
                if matches!(i.opcode(), aurora_asm::Opcode::HALT | aurora_asm::Opcode::RET)
        );
        if !terminated {
            match &f.ret {
                Some(ty) if ty.is_float() => self.manifest.push_instr(op::fmovi(0, 0.0)),
                _ => self.manifest.push_instr(op::movi(REG_RET, 0)),
            }
            if self.in_main {
                self.manifest.push_instr(op::halt());
            } else {
                self.manifest.push_instr(op::ret());
            }
        }

        self.scopes.clear();
        Ok(())
    }

    fn gen_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.gen_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    // ---- statements ----

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => self.gen_let(name, ty.as_ref(), value),
            StmtKind::Assign { name, value } => self.gen_assign(name, value),
            StmtKind::ArrayAssign { name, index, value } => {
                self.gen_array_assign(name, index, value)
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => self.gen_if(cond, then_block, else_block.as_ref()),
            StmtKind::While { cond, body } => self.gen_while(cond, body),
            StmtKind::For {
                iter,
                start,
                end,
                step,
                body,
            } => self.gen_for(stmt, iter, start, end, step.as_ref(), body),
            StmtKind::Break => {
                let target = self
                    .loops
                    .last()
                    .map(|ctx| ctx.break_to)
                    .ok_or_else(|| Self::err("break outside of a loop"))?;
                self.flush();
                self.manifest.push_instr(op::jmp(target));
                Ok(())
            }
            StmtKind::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|ctx| ctx.continue_to)
                    .ok_or_else(|| Self::err("continue outside of a loop"))?;
                self.flush();
                self.manifest.push_instr(op::jmp(target));
                Ok(())
            }
            StmtKind::Return(value) => self.gen_return(value.as_ref()),
            StmtKind::Atomic {
                kind,
                shared,
                value,
            } => self.gen_atomic(*kind, shared, value),
            StmtKind::Join(handle) => {
                let reg = self.eval_gp_temp(handle)?;
                self.manifest.push_instr(op::join(reg));
                self.gp.release_temp(reg);
                Ok(())
            }
            StmtKind::Request { service, arg } => self.gen_request(*service, arg.as_ref()),
            StmtKind::Expr(expr) => self.gen_expr_stmt(expr),
        }
    }

    fn gen_let(
        &mut self,
        name: &str,
        annot: Option<&Type>,
        value: &Expr,
    ) -> Result<(), CompileError> {
        if let ExprKind::ArrayLit(elems) = &value.kind {
            return self.gen_array_let(name, annot, elems);
        }

        let ty = self.ty_of(value)?;
        if ty.is_float() {
            let temp = self.eval_fp_temp(value)?;
            let info = self.declare(name, ty, None);
            let reg = self.fp.allocate_variable(&info.key, &mut self.frame)?;
            self.drain_spills();
            self.manifest.push_instr(op::fmov(reg, temp));
            self.fp.mark_initialized(&info.key);
            self.fp.release_temp(temp);
        } else {
            let temp = self.eval_gp_temp(value)?;
            let info = self.declare(name, ty, None);
            let reg = self.gp.allocate_variable(&info.key, &mut self.frame)?;
            self.drain_spills();
            self.manifest.push_instr(op::mov(reg, temp));
            self.gp.mark_initialized(&info.key);
            self.gp.release_temp(temp);
        }
        Ok(())
    }

    fn gen_array_let(
        &mut self,
        name: &str,
        annot: Option<&Type>,
        elems: &[Expr],
    ) -> Result<(), CompileError> {
        let elem_ty = match elems.first() {
            Some(first) => self.ty_of(first)?,
            None => match annot {
                Some(Type::Array(elem)) => (**elem).clone(),
                _ => return Err(Self::err("untyped empty array literal")),
            },
        };
        let len = elems.len() as u32;
        if len > u16::MAX as u32 {
            return Err(Self::err(format!("array literal of {len} elements")));
        }
        let base_slot = self.frame.reserve_block(len.max(1));
        self.manifest
            .push_instr(op::array_alloc(base_slot, len as u16));

        for (idx, elem) in elems.iter().enumerate() {
            let value = self.eval_gp_temp(elem)?;
            let index = self.gp.allocate_temp()?;
            self.manifest.push_instr(op::movi(index, idx as i32));
            self.manifest.push_instr(op::array_store(base_slot, index, value));
            self.gp.release_temp(index);
            self.gp.release_temp(value);
        }

        self.declare(
            name,
            Type::Array(Box::new(elem_ty)),
            Some(ArrayInfo { base_slot }),
        );
        Ok(())
    }

    fn gen_assign(&mut self, name: &str, value: &Expr) -> Result<(), CompileError> {
        // The right-hand side lands in a temporary before the target
        // register is committed, so `x = input()` reads first.
        if let Some(info) = self.lookup(name).cloned() {
            if info.ty.is_float() {
                let temp = self.eval_fp_temp(value)?;
                let reg = self.fp.allocate_variable(&info.key, &mut self.frame)?;
                self.drain_spills();
                self.manifest.push_instr(op::fmov(reg, temp));
                self.fp.mark_initialized(&info.key);
                self.fp.release_temp(temp);
            } else {
                let temp = self.eval_gp_temp(value)?;
                let reg = self.gp.allocate_variable(&info.key, &mut self.frame)?;
                self.drain_spills();
                self.manifest.push_instr(op::mov(reg, temp));
                self.gp.mark_initialized(&info.key);
                self.gp.release_temp(temp);
            }
            return Ok(());
        }

        // Direct (non-atomic) store to a shared cell.
        let cell = self
            .shared
            .get(name)
            .ok_or_else(|| Self::err(format!("assignment to unknown variable `{name}`")))?;
        let (label, float) = (cell.label, cell.ty.is_float());
        if float {
            let temp = self.eval_fp_temp(value)?;
            self.manifest.push_instr(op::st(label, temp));
            self.fp.release_temp(temp);
        } else {
            let temp = self.eval_gp_temp(value)?;
            self.manifest.push_instr(op::st(label, temp));
            self.gp.release_temp(temp);
        }
        Ok(())
    }

    fn gen_array_assign(
        &mut self,
        name: &str,
        index: &Expr,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let info = self
            .lookup(name)
            .cloned()
            .ok_or_else(|| Self::err(format!("unknown array `{name}`")))?;
        let array = info
            .array
            .ok_or_else(|| Self::err(format!("`{name}` is not an array")))?;
        let value_reg = self.eval_gp_temp(value)?;
        let index_reg = self.eval_gp_temp(index)?;
        self.manifest
            .push_instr(op::array_store(array.base_slot, index_reg, value_reg));
        self.gp.release_temp(index_reg);
        self.gp.release_temp(value_reg);
        Ok(())
    }

    fn gen_if(
        &mut self,
        cond: &Expr,
        then_block: &Block,
        else_block: Option<&Block>,
    ) -> Result<(), CompileError> {
        let end = self.fresh_label("endif");
        match else_block {
            None => {
                self.branch_false(cond, end)?;
                self.gen_block(then_block)?;
                self.place(end);
            }
            Some(else_block) => {
                let alt = self.fresh_label("else");
                self.branch_false(cond, alt)?;
                self.gen_block(then_block)?;
                self.flush();
                self.manifest.push_instr(op::jmp(end));
                self.place(alt);
                self.gen_block(else_block)?;
                self.place(end);
            }
        }
        Ok(())
    }

    /// Rotated loop: a guard up front, the condition re-evaluated at
    /// the end of the body with a back-edge.
    fn gen_while(&mut self, cond: &Expr, body: &Block) -> Result<(), CompileError> {
        let head = self.fresh_label("head");
        let cont = self.fresh_label("cont");
        let exit = self.fresh_label("exit");

        self.branch_false(cond, exit)?;
        self.place(head);
        self.loops.push(LoopCtx {
            continue_to: cont,
            break_to: exit,
        });
        self.gen_block(body)?;
        self.loops.pop();
        self.place(cont);
        self.branch_true(cond, head)?;
        self.place(exit);
        Ok(())
    }

    /// `for i in lo..hi step s` desugars to
    /// `let i = lo; while i < hi { body; i = i + s }` with `continue`
    /// jumping to the increment.
    fn gen_for(
        &mut self,
        stmt: &Stmt,
        iter: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> Result<(), CompileError> {
        let at = |kind| Expr {
            kind,
            line: stmt.line,
            column: stmt.column,
        };

        self.scopes.push(HashMap::new());
        self.gen_let(iter, Some(&Type::Int), start)?;

        let cond = at(ExprKind::Binary {
            op: BinOp::Lt,
            lhs: Box::new(at(ExprKind::Var(iter.to_owned()))),
            rhs: Box::new(end.clone()),
        });
        let step = step.cloned().unwrap_or_else(|| at(ExprKind::Int(1)));
        let bump = at(ExprKind::Binary {
            op: BinOp::Add,
            lhs: Box::new(at(ExprKind::Var(iter.to_owned()))),
            rhs: Box::new(step),
        });

        let head = self.fresh_label("head");
        let incr = self.fresh_label("step");
        let exit = self.fresh_label("exit");

        self.branch_false(&cond, exit)?;
        self.place(head);
        self.loops.push(LoopCtx {
            continue_to: incr,
            break_to: exit,
        });
        self.gen_block(body)?;
        self.loops.pop();
        self.place(incr);
        self.gen_assign(iter, &bump)?;
        self.branch_true(&cond, head)?;
        self.place(exit);

        self.scopes.pop();
        Ok(())
    }

    fn gen_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        match value {
            None => self.manifest.push_instr(op::movi(REG_RET, 0)),
            Some(value) => {
                if self.ty_of(value)?.is_float() {
                    let temp = self.eval_fp_temp(value)?;
                    self.manifest.push_instr(op::fmov(0, temp));
                    self.fp.release_temp(temp);
                } else {
                    let temp = self.eval_gp_temp(value)?;
                    self.manifest.push_instr(op::mov(REG_RET, temp));
                    self.gp.release_temp(temp);
                }
            }
        }
        if self.in_main {
            self.manifest.push_instr(op::halt());
        } else {
            self.manifest.push_instr(op::ret());
        }
        Ok(())
    }

    fn gen_atomic(
        &mut self,
        kind: AtomicKind,
        shared: &str,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let cell = self
            .shared
            .get(shared)
            .ok_or_else(|| Self::err(format!("`{shared}` is not shared")))?;
        let (label, float) = (cell.label, cell.ty.is_float());
        if float {
            let temp = self.eval_fp_temp(value)?;
            let instr = match kind {
                AtomicKind::Add => op::atomic_fadd(label, temp),
                AtomicKind::Store => op::atomic_store(label, temp),
            };
            self.manifest.push_instr(instr);
            self.fp.release_temp(temp);
        } else {
            let temp = self.eval_gp_temp(value)?;
            let instr = match kind {
                AtomicKind::Add => op::atomic_add(label, temp),
                AtomicKind::Store => op::atomic_store(label, temp),
            };
            self.manifest.push_instr(instr);
            self.gp.release_temp(temp);
        }
        Ok(())
    }

    fn gen_request(
        &mut self,
        service: RequestService,
        arg: Option<&Expr>,
    ) -> Result<(), CompileError> {
        match service {
            RequestService::Print => {
                let arg = arg.ok_or_else(|| Self::err("print without an argument"))?;
                match self.ty_of(arg)? {
                    Type::Float => {
                        let temp = self.eval_fp_temp(arg)?;
                        // Floats travel via xmm6 so the stub can keep
                        // xmm0..xmm5 intact for live variables.
                        self.manifest
                            .push_instr(op::fmov(aurora_asm::XMM_TMP0, temp));
                        self.manifest.push_instr(op::svc(ServiceCode::PrintFloat));
                        self.fp.release_temp(temp);
                    }
                    Type::Str => {
                        let temp = self.eval_gp_temp(arg)?;
                        self.manifest.push_instr(op::mov(REG_RET, temp));
                        self.manifest.push_instr(op::svc(ServiceCode::PrintString));
                        self.gp.release_temp(temp);
                    }
                    _ => {
                        let temp = self.eval_gp_temp(arg)?;
                        self.manifest.push_instr(op::mov(REG_RET, temp));
                        self.manifest.push_instr(op::svc(ServiceCode::PrintInt));
                        self.gp.release_temp(temp);
                    }
                }
            }
            RequestService::Exit | RequestService::Pause => {
                let code = match service {
                    RequestService::Exit => ServiceCode::Exit,
                    _ => ServiceCode::Pause,
                };
                let arg = arg.ok_or_else(|| Self::err("service without an exit code"))?;
                let temp = self.eval_gp_temp(arg)?;
                self.manifest.push_instr(op::mov(REG_RET, temp));
                self.manifest.push_instr(op::svc(code));
                self.gp.release_temp(temp);
            }
            RequestService::PauseSilent => {
                self.manifest.push_instr(op::movi(REG_RET, 0));
                self.manifest.push_instr(op::svc(ServiceCode::PauseSilent));
            }
        }
        Ok(())
    }

    fn gen_expr_stmt(&mut self, expr: &Expr) -> Result<(), CompileError> {
        if let ExprKind::Call { name, args } = &expr.kind {
            // Result, if any, is discarded in r0/xmm0.
            self.gen_call(name, args)?;
            return Ok(());
        }
        if self.ty_of(expr)?.is_float() {
            let temp = self.eval_fp_temp(expr)?;
            self.fp.release_temp(temp);
        } else {
            let temp = self.eval_gp_temp(expr)?;
            self.gp.release_temp(temp);
        }
        Ok(())
    }

    // ---- data section ----

    fn emit_data(&mut self, program: &Program) -> Result<(), CompileError> {
        if !self.strings.is_empty() {
            self.manifest.push(Directive::Pad(8));
            for (label, bytes) in std::mem::take(&mut self.strings) {
                self.manifest.place_label(label);
                self.manifest.push(Directive::Ascii(bytes));
            }
        }
        if !program.shared.is_empty() {
            self.manifest.push(Directive::Pad(8));
            for decl in &program.shared {
                let cell = &self.shared[&decl.name];
                let (ty, value) = match &cell.ty {
                    Type::Float => (SharedType::Float, const_float_bits(&decl.init)?),
                    _ => (SharedType::Int, const_int(&decl.init)? as Word),
                };
                self.manifest.push(Directive::Shared {
                    label: cell.label,
                    ty,
                    value,
                });
            }
        }
        Ok(())
    }
}

fn const_int(expr: &Expr) -> Result<i64, CompileError> {
    match &expr.kind {
        ExprKind::Int(v) => Ok(*v),
        ExprKind::Bool(b) => Ok(*b as i64),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => Ok(-const_int(operand)?),
        _ => Err(CodeGen::err("shared initializer must be a literal")),
    }
}

fn const_float_bits(expr: &Expr) -> Result<Word, CompileError> {
    fn fold(expr: &Expr) -> Result<f64, CompileError> {
        match &expr.kind {
            ExprKind::Float(v) => Ok(*v),
            ExprKind::Unary {
                op: UnOp::Neg,
                operand,
            } => Ok(-fold(operand)?),
            _ => Err(CodeGen::err("shared initializer must be a literal")),
        }
    }
    Ok(fold(expr)?.to_bits())
}

//! Post-parse validation: scope resolution and type checking.

use std::collections::HashMap;

use itertools::Itertools;

use crate::error::CompileError;
use crate::ir::*;

/// Verifies scope and type rules over a parsed program.
///
/// Checks that every variable reference resolves, that operand and
/// return types agree, that `main` is present with a legal signature,
/// that `spawn` targets an arity-0 function, and that atomics target
/// `shared` declarations. Array bounds stay symbolic.
pub fn check(program: &Program) -> Result<(), CompileError> {
    Checker::new(program)?.run(program)
}

struct FnSig {
    params: Vec<Type>,
    ret: Option<Type>,
}

struct Checker {
    funcs: HashMap<String, FnSig>,
    shared: HashMap<String, Type>,
    scopes: Vec<HashMap<String, Type>>,
    ret: Option<Type>,
    loop_depth: usize,
}

impl Checker {
    fn new(program: &Program) -> Result<Self, CompileError> {
        let mut shared = HashMap::new();
        for decl in &program.shared {
            if !matches!(decl.ty, Type::Int | Type::Float) {
                return Err(CompileError::type_at(
                    format!("shared `{}` must be int or float, not {}", decl.name, decl.ty),
                    decl.line,
                    decl.column,
                ));
            }
            if shared.insert(decl.name.clone(), decl.ty.clone()).is_some() {
                return Err(CompileError::type_at(
                    format!("shared `{}` declared twice", decl.name),
                    decl.line,
                    decl.column,
                ));
            }
            let init_ty = literal_type(&decl.init).ok_or_else(|| {
                CompileError::type_at(
                    format!("shared `{}` initializer must be a literal", decl.name),
                    decl.init.line,
                    decl.init.column,
                )
            })?;
            if init_ty != decl.ty {
                return Err(CompileError::type_at(
                    format!(
                        "shared `{}` is {} but its initializer is {init_ty}",
                        decl.name, decl.ty
                    ),
                    decl.init.line,
                    decl.init.column,
                ));
            }
        }

        if let Some(f) = program
            .functions
            .iter()
            .duplicates_by(|f| f.name.as_str())
            .next()
        {
            return Err(CompileError::type_at(
                format!("function `{}` declared twice", f.name),
                f.line,
                f.column,
            ));
        }
        let funcs = program
            .functions
            .iter()
            .map(|f| {
                let sig = FnSig {
                    params: f.params.iter().map(|p| p.ty.clone()).collect(),
                    ret: f.ret.clone(),
                };
                (f.name.clone(), sig)
            })
            .collect();

        Ok(Self {
            funcs,
            shared,
            scopes: Vec::new(),
            ret: None,
            loop_depth: 0,
        })
    }

    fn run(mut self, program: &Program) -> Result<(), CompileError> {
        let main = program.functions.iter().find(|f| f.name == "main");
        match main {
            None => {
                return Err(CompileError::Type {
                    message: "program has no `main` function".into(),
                    line: 1,
                    column: 1,
                })
            }
            Some(main) => {
                if !main.params.is_empty() {
                    return Err(CompileError::type_at(
                        "`main` takes no parameters",
                        main.line,
                        main.column,
                    ));
                }
                if !matches!(main.ret, None | Some(Type::Int)) {
                    return Err(CompileError::type_at(
                        "`main` must return int or nothing",
                        main.line,
                        main.column,
                    ));
                }
            }
        }

        for f in &program.functions {
            self.check_function(f)?;
        }
        Ok(())
    }

    fn check_function(&mut self, f: &FunctionDecl) -> Result<(), CompileError> {
        let mut params = HashMap::new();
        for p in &f.params {
            if matches!(p.ty, Type::Array(_)) {
                return Err(CompileError::type_at(
                    format!("parameter `{}`: arrays cannot be passed to functions", p.name),
                    f.line,
                    f.column,
                ));
            }
            if params.insert(p.name.clone(), p.ty.clone()).is_some() {
                return Err(CompileError::type_at(
                    format!("parameter `{}` declared twice", p.name),
                    f.line,
                    f.column,
                ));
            }
        }
        self.scopes = vec![params];
        self.ret = f.ret.clone();
        self.loop_depth = 0;
        self.check_block(&f.body)
    }

    fn check_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.check_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.shared.get(name))
    }

    fn declare(&mut self, name: &str, ty: Type) {
        self.scopes
            .last_mut()
            .expect("inside a function")
            .insert(name.to_owned(), ty);
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let err = |message: String| CompileError::type_at(message, stmt.line, stmt.column);
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                let value_ty = if let ExprKind::ArrayLit(elems) = &value.kind {
                    self.check_array_literal(ty.as_ref(), elems, stmt)?
                } else {
                    self.infer(value)?
                };
                if let Some(annot) = ty {
                    if *annot != value_ty {
                        return Err(err(format!(
                            "`{name}` is declared {annot} but its initializer is {value_ty}"
                        )));
                    }
                }
                self.declare(name, value_ty);
                Ok(())
            }
            StmtKind::Assign { name, value } => {
                let value_ty = self.infer(value)?;
                let var_ty = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| err(format!("assignment to undefined variable `{name}`")))?;
                if matches!(var_ty, Type::Array(_)) {
                    return Err(err(format!(
                        "array `{name}` can only be assigned element-wise"
                    )));
                }
                if var_ty != value_ty {
                    return Err(err(format!(
                        "cannot assign {value_ty} to `{name}` of type {var_ty}"
                    )));
                }
                Ok(())
            }
            StmtKind::ArrayAssign { name, index, value } => {
                let elem = match self.lookup(name).cloned() {
                    Some(Type::Array(elem)) => *elem,
                    Some(other) => {
                        return Err(err(format!("`{name}` is {other}, not an array")))
                    }
                    None => return Err(err(format!("undefined array `{name}`"))),
                };
                let index_ty = self.infer(index)?;
                if index_ty != Type::Int {
                    return Err(err(format!("array index must be int, not {index_ty}")));
                }
                let value_ty = self.infer(value)?;
                if value_ty != elem {
                    return Err(err(format!(
                        "cannot store {value_ty} into array of {elem}"
                    )));
                }
                Ok(())
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expect_bool(cond)?;
                self.check_block(then_block)?;
                if let Some(else_block) = else_block {
                    self.check_block(else_block)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.expect_bool(cond)?;
                self.loop_depth += 1;
                self.check_block(body)?;
                self.loop_depth -= 1;
                Ok(())
            }
            StmtKind::For {
                iter,
                start,
                end,
                step,
                body,
            } => {
                for (what, e) in [("range start", start), ("range end", end)] {
                    let ty = self.infer(e)?;
                    if ty != Type::Int {
                        return Err(err(format!("{what} must be int, not {ty}")));
                    }
                }
                if let Some(step) = step {
                    let ty = self.infer(step)?;
                    if ty != Type::Int {
                        return Err(err(format!("step must be int, not {ty}")));
                    }
                }
                self.scopes.push(HashMap::new());
                self.declare(iter, Type::Int);
                self.loop_depth += 1;
                self.check_block(body)?;
                self.loop_depth -= 1;
                self.scopes.pop();
                Ok(())
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    let what = if stmt.kind == StmtKind::Break {
                        "break"
                    } else {
                        "continue"
                    };
                    return Err(err(format!("`{what}` outside of a loop")));
                }
                Ok(())
            }
            StmtKind::Return(value) => match (&self.ret, value) {
                (None, None) => Ok(()),
                (None, Some(_)) => Err(err("function has no return type".into())),
                (Some(expected), None) => {
                    Err(err(format!("function must return {expected}")))
                }
                (Some(expected), Some(value)) => {
                    let expected = expected.clone();
                    let ty = self.infer(value)?;
                    if ty != expected {
                        Err(err(format!("returning {ty} from a {expected} function")))
                    } else {
                        Ok(())
                    }
                }
            },
            StmtKind::Atomic { shared, value, .. } => {
                let cell_ty = self
                    .shared
                    .get(shared)
                    .cloned()
                    .ok_or_else(|| err(format!("`{shared}` is not a shared variable")))?;
                let value_ty = self.infer(value)?;
                if value_ty != cell_ty {
                    return Err(err(format!(
                        "atomic operand is {value_ty} but `{shared}` is {cell_ty}"
                    )));
                }
                Ok(())
            }
            StmtKind::Join(handle) => {
                let ty = self.infer(handle)?;
                if ty != Type::Thread {
                    return Err(err(format!("join expects a thread handle, not {ty}")));
                }
                Ok(())
            }
            StmtKind::Request { service, arg } => match (service, arg) {
                (RequestService::Print, Some(arg)) => {
                    let ty = self.infer(arg)?;
                    if !matches!(ty, Type::Int | Type::Float | Type::Str) {
                        return Err(err(format!("cannot print a value of type {ty}")));
                    }
                    Ok(())
                }
                (RequestService::Print, None) => Err(err("print needs an argument".into())),
                (RequestService::Exit | RequestService::Pause, Some(arg)) => {
                    let ty = self.infer(arg)?;
                    if ty != Type::Int {
                        return Err(err(format!("exit code must be int, not {ty}")));
                    }
                    Ok(())
                }
                (RequestService::Exit | RequestService::Pause, None) => {
                    Err(err("service needs an exit code".into()))
                }
                (RequestService::PauseSilent, None) => Ok(()),
                (RequestService::PauseSilent, Some(_)) => {
                    Err(err("pause_silent takes no argument".into()))
                }
            },
            StmtKind::Expr(expr) => {
                // Void calls are legal only here.
                if let ExprKind::Call { name, args } = &expr.kind {
                    self.check_call(name, args, expr)?;
                    Ok(())
                } else {
                    self.infer(expr).map(|_| ())
                }
            }
        }
    }

    fn check_array_literal(
        &mut self,
        annot: Option<&Type>,
        elems: &[Expr],
        stmt: &Stmt,
    ) -> Result<Type, CompileError> {
        let err = |message: String| CompileError::type_at(message, stmt.line, stmt.column);
        let first = match elems.first() {
            Some(first) => self.infer(first)?,
            None => match annot {
                Some(Type::Array(elem)) => (**elem).clone(),
                _ => return Err(err("empty array literal needs a type annotation".into())),
            },
        };
        if !matches!(first, Type::Int | Type::Bool) {
            return Err(err(format!("array elements must be int or bool, not {first}")));
        }
        for elem in elems {
            let ty = self.infer(elem)?;
            if ty != first {
                return Err(err(format!(
                    "mixed element types in array literal: {first} and {ty}"
                )));
            }
        }
        Ok(Type::Array(Box::new(first)))
    }

    fn expect_bool(&mut self, cond: &Expr) -> Result<(), CompileError> {
        let ty = self.infer(cond)?;
        if ty != Type::Bool {
            return Err(CompileError::type_at(
                format!("condition must be bool, not {ty}"),
                cond.line,
                cond.column,
            ));
        }
        Ok(())
    }

    fn check_call(
        &mut self,
        name: &str,
        args: &[Expr],
        expr: &Expr,
    ) -> Result<Option<Type>, CompileError> {
        let err = |message: String| CompileError::type_at(message, expr.line, expr.column);
        let (params, ret) = match self.funcs.get(name) {
            Some(sig) => (sig.params.clone(), sig.ret.clone()),
            None => return Err(err(format!("call to undefined function `{name}`"))),
        };
        if params.len() != args.len() {
            return Err(err(format!(
                "`{name}` takes {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        for (param, arg) in params.iter().zip(args) {
            let ty = self.infer(arg)?;
            if &ty != param {
                return Err(err(format!(
                    "argument to `{name}` is {ty}, expected {param}"
                )));
            }
        }
        Ok(ret)
    }

    fn infer(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        let err = |message: String| CompileError::type_at(message, expr.line, expr.column);
        match &expr.kind {
            ExprKind::Int(_) => Ok(Type::Int),
            ExprKind::Float(_) => Ok(Type::Float),
            ExprKind::Bool(_) => Ok(Type::Bool),
            ExprKind::Str(_) => Ok(Type::Str),
            ExprKind::Input => Ok(Type::Int),
            ExprKind::Var(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| err(format!("undefined variable `{name}`"))),
            ExprKind::Binary { op, lhs, rhs } => {
                let lt = self.infer(lhs)?;
                let rt = self.infer(rhs)?;
                if lt != rt {
                    return Err(err(format!("operand types differ: {lt} and {rt}")));
                }
                match op {
                    BinOp::And | BinOp::Or => {
                        if lt != Type::Bool {
                            return Err(err(format!("logical operator needs bool, got {lt}")));
                        }
                        Ok(Type::Bool)
                    }
                    BinOp::Eq | BinOp::Ne => {
                        if !matches!(lt, Type::Int | Type::Float | Type::Bool) {
                            return Err(err(format!("cannot compare values of type {lt}")));
                        }
                        Ok(Type::Bool)
                    }
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        if !matches!(lt, Type::Int | Type::Float) {
                            return Err(err(format!("cannot order values of type {lt}")));
                        }
                        Ok(Type::Bool)
                    }
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                        if !matches!(lt, Type::Int | Type::Float) {
                            return Err(err(format!("arithmetic needs int or float, got {lt}")));
                        }
                        Ok(lt)
                    }
                    BinOp::Rem => {
                        if lt != Type::Int {
                            return Err(err(format!("`%` needs int operands, got {lt}")));
                        }
                        Ok(Type::Int)
                    }
                    BinOp::BitAnd
                    | BinOp::BitOr
                    | BinOp::BitXor
                    | BinOp::Shl
                    | BinOp::Shr => {
                        if lt != Type::Int {
                            return Err(err(format!("bitwise operator needs int, got {lt}")));
                        }
                        Ok(Type::Int)
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                let ty = self.infer(operand)?;
                match op {
                    UnOp::Neg if matches!(ty, Type::Int | Type::Float) => Ok(ty),
                    UnOp::Not if ty == Type::Bool => Ok(Type::Bool),
                    UnOp::BitNot if ty == Type::Int => Ok(Type::Int),
                    UnOp::Neg => Err(err(format!("cannot negate {ty}"))),
                    UnOp::Not => Err(err(format!("`!` needs bool, got {ty}"))),
                    UnOp::BitNot => Err(err(format!("`~` needs int, got {ty}"))),
                }
            }
            ExprKind::Cast { ty, expr: inner } => {
                let from = self.infer(inner)?;
                match (&from, ty) {
                    (Type::Int, Type::Float) | (Type::Float, Type::Int) => Ok(ty.clone()),
                    _ => Err(err(format!("`as` cannot convert {from} to {ty}"))),
                }
            }
            ExprKind::Call { name, args } => match self.check_call(name, args, expr)? {
                Some(ret) => Ok(ret),
                None => Err(err(format!("`{name}` has no return value"))),
            },
            ExprKind::ArrayLit(_) => {
                Err(err("array literals are only allowed as initializers".into()))
            }
            ExprKind::ArrayIndex { name, index } => {
                let elem = match self.lookup(name).cloned() {
                    Some(Type::Array(elem)) => *elem,
                    Some(other) => {
                        return Err(err(format!("`{name}` is {other}, not an array")))
                    }
                    None => return Err(err(format!("undefined array `{name}`"))),
                };
                let index_ty = self.infer(index)?;
                if index_ty != Type::Int {
                    return Err(err(format!("array index must be int, not {index_ty}")));
                }
                Ok(elem)
            }
            ExprKind::AtomicLoad(shared) => self
                .shared
                .get(shared)
                .cloned()
                .ok_or_else(|| err(format!("`{shared}` is not a shared variable"))),
            ExprKind::Spawn(func) => {
                let sig = self
                    .funcs
                    .get(func)
                    .ok_or_else(|| err(format!("spawn of undefined function `{func}`")))?;
                if !sig.params.is_empty() {
                    return Err(err(format!("spawned function `{func}` must take no arguments")));
                }
                if !matches!(sig.ret, None | Some(Type::Int)) {
                    return Err(err(format!(
                        "spawned function `{func}` must return int or nothing"
                    )));
                }
                Ok(Type::Thread)
            }
        }
    }
}

/// Constant-folds a literal expression to its type; `None` when the
/// expression is not a (possibly negated) literal.
fn literal_type(expr: &Expr) -> Option<Type> {
    match &expr.kind {
        ExprKind::Int(_) => Some(Type::Int),
        ExprKind::Float(_) => Some(Type::Float),
        ExprKind::Bool(_) => Some(Type::Bool),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => literal_type(operand),
        _ => None,
    }
}

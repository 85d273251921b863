//! Semantic analysis - binds identifiers to declarations and checks types

use std::ops::{Deref, DerefMut};

use hlx_ast::*;
use hlx_lexer::Span;
use thiserror::Error;
use tracing::debug;

use crate::hir::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Error or warning produced during resolution
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{severity}: {message}")]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

/// Result of resolving a source file. `program` is `None` if any error was
/// reported; warnings never prevent it.
#[derive(Debug)]
pub struct Resolution {
    pub program: Option<ResolvedProgram>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Resolution {
    pub fn is_success(&self) -> bool {
        self.program.is_some()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}

/// Name resolver and type checker
pub struct Resolver {
    /// Declaration arena, handed over to the program on success
    decls: Vec<DeclInfo>,
    functions: Vec<ResolvedFunction>,
    /// Scope frames, innermost last. Frames only list members; the arena owns them.
    scopes: Vec<Vec<DeclId>>,
    diagnostics: Vec<Diagnostic>,
    /// Return type of the function whose body is being resolved
    current_return: Type,
}

/// Pops its frame when dropped, so every exit path out of a scope releases it
struct ScopeGuard<'r> {
    resolver: &'r mut Resolver,
}

impl Deref for ScopeGuard<'_> {
    type Target = Resolver;

    fn deref(&self) -> &Resolver {
        self.resolver
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Resolver {
        self.resolver
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.resolver.scopes.pop();
    }
}

fn resolve_type(kind: &TypeKind) -> Option<Type> {
    match kind {
        TypeKind::Void => Some(Type::Void),
        TypeKind::Number => Some(Type::Number),
        TypeKind::Custom(_) => None,
    }
}

impl Resolver {
    fn new() -> Self {
        Self {
            decls: Vec::new(),
            functions: Vec::new(),
            scopes: Vec::new(),
            diagnostics: Vec::new(),
            current_return: Type::Void,
        }
    }

    /// Resolve a parsed source file
    pub fn resolve(file: &SourceFile) -> Resolution {
        let mut resolver = Resolver::new();
        let ok = resolver.resolve_source_file(file);

        debug!(
            functions = resolver.functions.len(),
            decls = resolver.decls.len(),
            diagnostics = resolver.diagnostics.len(),
            ok,
            "resolved source file"
        );

        let program = if ok {
            Some(ResolvedProgram {
                decls: std::mem::take(&mut resolver.decls),
                functions: std::mem::take(&mut resolver.functions),
            })
        } else {
            None
        };

        Resolution {
            program,
            diagnostics: resolver.diagnostics,
        }
    }

    // === Diagnostics ===

    fn error(&mut self, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message,
            span,
        });
    }

    fn warning(&mut self, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message,
            span,
        });
    }

    // === Scopes ===

    fn scope(&mut self) -> ScopeGuard<'_> {
        self.scopes.push(Vec::new());
        ScopeGuard { resolver: self }
    }

    fn new_decl(&mut self, name: String, kind: DeclKind, ty: Type, span: Span) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(DeclInfo {
            id,
            name,
            kind,
            ty,
            span,
        });
        id
    }

    /// Innermost declaration named `name`, with the number of frames between
    /// it and the current one (0 = current frame)
    fn lookup(&self, name: &str) -> Option<(DeclId, usize)> {
        self.scopes
            .iter()
            .rev()
            .enumerate()
            .find_map(|(depth, frame)| {
                frame
                    .iter()
                    .find(|id| self.decls[id.index()].name == name)
                    .map(|&id| (id, depth))
            })
    }

    /// Shadowing an outer frame is fine; a second declaration in the same frame is not.
    fn insert_decl(&mut self, id: DeclId) -> bool {
        let name = self.decls[id.index()].name.clone();
        if let Some((_, 0)) = self.lookup(&name) {
            let span = self.decls[id.index()].span;
            self.error(format!("redeclaration of '{}'", name), span);
            return false;
        }

        if let Some(frame) = self.scopes.last_mut() {
            frame.push(id);
        }
        true
    }

    // === Program ===

    fn resolve_source_file(&mut self, file: &SourceFile) -> bool {
        let mut global = self.scope();

        // Declared before user functions so redefinitions of it are caught.
        let println = global.declare_builtin_println();
        global.insert_decl(println);

        // Signature pass: every function is visible before any body is resolved.
        let mut failed = false;
        for function in &file.functions {
            match global.resolve_signature(function) {
                Some(resolved) => {
                    let decl = resolved.decl;
                    global.functions.push(resolved);
                    if !global.insert_decl(decl) {
                        failed = true;
                    }
                }
                None => failed = true,
            }
        }

        if failed {
            return false;
        }

        // Body pass, skipping the builtin at index 0
        for (index, function) in file.functions.iter().enumerate() {
            let id = FnId(index as u32 + 1);
            let mut scope = global.scope();

            let (params, return_type) = {
                let resolved = &scope.functions[id.index()];
                (resolved.params.clone(), resolved.return_type)
            };
            scope.current_return = return_type;
            for param in params {
                scope.insert_decl(param);
            }

            match scope.resolve_block(&function.body) {
                Some(body) => scope.functions[id.index()].body = body,
                None => failed = true,
            }
        }

        !failed
    }

    fn declare_builtin_println(&mut self) -> DeclId {
        let id = FnId(self.functions.len() as u32);
        let decl = self.new_decl(
            "println".to_string(),
            DeclKind::Function(id),
            Type::Void,
            Span::default(),
        );
        let param = self.new_decl("n".to_string(), DeclKind::Param, Type::Number, Span::default());

        self.functions.push(ResolvedFunction {
            id,
            decl,
            name: "println".to_string(),
            params: vec![param],
            return_type: Type::Void,
            body: ResolvedBlock::default(),
            is_builtin: true,
            span: Span::default(),
        });
        decl
    }

    fn resolve_signature(&mut self, function: &FunctionDecl) -> Option<ResolvedFunction> {
        let name = &function.name.name;

        let Some(return_type) = resolve_type(&function.return_type.kind) else {
            self.error(
                format!(
                    "function '{}' has invalid '{}' type",
                    name, function.return_type.kind
                ),
                function.span,
            );
            return None;
        };

        if name == "main" {
            if return_type != Type::Void {
                self.error(
                    "'main' function is expected to have 'void' type".to_string(),
                    function.span,
                );
                return None;
            }
            if !function.params.is_empty() {
                self.error(
                    "'main' function is expected to take no arguments".to_string(),
                    function.span,
                );
                return None;
            }
        }

        let id = FnId(self.functions.len() as u32);
        let decl = self.new_decl(name.clone(), DeclKind::Function(id), return_type, function.span);

        // Short-lived frame: only checks that parameter names are unique.
        let mut scope = self.scope();
        let mut params = Vec::with_capacity(function.params.len());
        for param in &function.params {
            let param = scope.resolve_param(param)?;
            if !scope.insert_decl(param) {
                return None;
            }
            params.push(param);
        }

        Some(ResolvedFunction {
            id,
            decl,
            name: name.clone(),
            params,
            return_type,
            body: ResolvedBlock::default(),
            is_builtin: false,
            span: function.span,
        })
    }

    fn resolve_param(&mut self, param: &ParamDecl) -> Option<DeclId> {
        match resolve_type(&param.ty.kind) {
            Some(Type::Number) => Some(self.new_decl(
                param.name.name.clone(),
                DeclKind::Param,
                Type::Number,
                param.span,
            )),
            _ => {
                self.error(
                    format!(
                        "parameter '{}' has invalid '{}' type",
                        param.name.name, param.ty.kind
                    ),
                    param.span,
                );
                None
            }
        }
    }

    // === Statements ===

    fn resolve_block(&mut self, block: &Block) -> Option<ResolvedBlock> {
        let mut scope = self.scope();

        let mut stmts = Vec::with_capacity(block.stmts.len());
        let mut failed = false;
        // 0: no return yet, 1: return seen, 2+: already warned
        let mut returns_seen = 0;

        for stmt in &block.stmts {
            match scope.resolve_stmt(stmt) {
                Some(resolved) => stmts.push(resolved),
                None => failed = true,
            }
            if failed {
                continue;
            }

            if returns_seen == 1 {
                scope.warning("unreachable statement".to_string(), stmt.span());
                returns_seen += 1;
            }
            if matches!(stmt, Stmt::Return(_)) {
                returns_seen += 1;
            }
        }

        if failed {
            return None;
        }

        Some(ResolvedBlock {
            stmts,
            span: block.span,
        })
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) -> Option<ResolvedStmt> {
        match stmt {
            Stmt::Expr(expr) => self.resolve_expr(expr).map(ResolvedStmt::Expr),
            Stmt::If(s) => self.resolve_if(s),
            Stmt::While(s) => self.resolve_while(s),
            Stmt::Decl(s) => self.resolve_decl_stmt(s),
            Stmt::Assign(s) => self.resolve_assignment(s),
            Stmt::Return(s) => self.resolve_return(s),
        }
    }

    fn resolve_condition(&mut self, cond: &Expr) -> Option<ResolvedExpr> {
        let cond = self.resolve_expr(cond)?;
        if cond.ty != Type::Number {
            self.error("expected number in condition".to_string(), cond.span);
            return None;
        }
        Some(cond)
    }

    fn resolve_if(&mut self, s: &IfStmt) -> Option<ResolvedStmt> {
        let cond = self.resolve_condition(&s.condition)?;
        let then_block = self.resolve_block(&s.then_block)?;
        let else_block = match &s.else_block {
            Some(block) => Some(self.resolve_block(block)?),
            None => None,
        };

        Some(ResolvedStmt::If {
            cond,
            then_block,
            else_block,
            span: s.span,
        })
    }

    fn resolve_while(&mut self, s: &WhileStmt) -> Option<ResolvedStmt> {
        let cond = self.resolve_condition(&s.condition)?;
        let body = self.resolve_block(&s.body)?;

        Some(ResolvedStmt::While {
            cond,
            body,
            span: s.span,
        })
    }

    fn resolve_decl_stmt(&mut self, s: &DeclStmt) -> Option<ResolvedStmt> {
        // The initializer is resolved before the name is in scope, so
        // `let x = x + 1;` reads an outer `x`.
        let (decl, init) = self.resolve_var_decl(&s.var)?;
        if !self.insert_decl(decl) {
            return None;
        }

        Some(ResolvedStmt::Decl {
            decl,
            init,
            span: s.span,
        })
    }

    fn resolve_var_decl(&mut self, var: &VarDecl) -> Option<(DeclId, Option<ResolvedExpr>)> {
        let name = &var.name.name;

        let init = match &var.init {
            Some(init) => Some(self.resolve_expr(init)?),
            None => None,
        };

        let (ty, written) = match (&var.ty, &init) {
            (Some(spec), _) => (resolve_type(&spec.kind), spec.kind.to_string()),
            (None, Some(init)) => (Some(init.ty), init.ty.to_string()),
            (None, None) => {
                self.error(
                    "uninitialized variable is expected to have a type specifier".to_string(),
                    var.span,
                );
                return None;
            }
        };

        let ty = match ty {
            Some(Type::Number) => Type::Number,
            _ => {
                self.error(
                    format!("variable '{}' has invalid '{}' type", name, written),
                    var.span,
                );
                return None;
            }
        };

        if let Some(init) = &init {
            if init.ty != ty {
                self.error("initializer type mismatch".to_string(), init.span);
                return None;
            }
        }

        let decl = self.new_decl(
            name.clone(),
            DeclKind::Var {
                is_mutable: var.is_mutable,
            },
            ty,
            var.span,
        );
        Some((decl, init))
    }

    fn resolve_assignment(&mut self, s: &Assignment) -> Option<ResolvedStmt> {
        let target = self.resolve_decl_ref(&s.target, false)?;
        let value = self.resolve_expr(&s.value)?;

        let (kind, ty) = {
            let info = &self.decls[target.index()];
            (info.kind, info.ty)
        };

        match kind {
            DeclKind::Param => {
                self.error(
                    "parameters are immutable and cannot be assigned".to_string(),
                    s.target.span,
                );
                return None;
            }
            DeclKind::Var { is_mutable: false } => {
                self.error(
                    format!("'{}' cannot be mutated", s.target.name),
                    s.target.span,
                );
                return None;
            }
            _ => {}
        }

        if value.ty != ty {
            self.error(
                "assigned value type doesn't match variable type".to_string(),
                value.span,
            );
            return None;
        }

        Some(ResolvedStmt::Assign {
            target,
            value,
            span: s.span,
        })
    }

    fn resolve_return(&mut self, s: &ReturnStmt) -> Option<ResolvedStmt> {
        let is_void = self.current_return == Type::Void;

        if is_void && s.value.is_some() {
            self.error("unexpected return value in void function".to_string(), s.span);
            return None;
        }
        if !is_void && s.value.is_none() {
            self.error("expected a return value".to_string(), s.span);
            return None;
        }

        let value = match &s.value {
            Some(expr) => {
                let value = self.resolve_expr(expr)?;
                if value.ty != self.current_return {
                    self.error("unexpected return type".to_string(), value.span);
                    return None;
                }
                Some(value)
            }
            None => None,
        };

        Some(ResolvedStmt::Return {
            value,
            span: s.span,
        })
    }

    // === Expressions ===

    fn resolve_expr(&mut self, expr: &Expr) -> Option<ResolvedExpr> {
        let (kind, ty) = match &expr.kind {
            ExprKind::NumberLiteral(text) => match text.parse::<f64>() {
                Ok(value) => (ResolvedExprKind::Number(value), Type::Number),
                Err(_) => {
                    self.error(format!("invalid number literal '{}'", text), expr.span);
                    return None;
                }
            },
            ExprKind::DeclRef(ident) => {
                let decl = self.resolve_decl_ref(ident, false)?;
                (ResolvedExprKind::DeclRef(decl), self.decls[decl.index()].ty)
            }
            ExprKind::Call(callee, args) => return self.resolve_call(expr, callee, args),
            ExprKind::Binary(left, op, right) => {
                let left = self.resolve_expr(left)?;
                let right = self.resolve_expr(right)?;

                if left.ty == Type::Void {
                    self.error(
                        "void expression cannot be used as LHS operand to binary operator"
                            .to_string(),
                        left.span,
                    );
                    return None;
                }
                if right.ty == Type::Void {
                    self.error(
                        "void expression cannot be used as RHS operand to binary operator"
                            .to_string(),
                        right.span,
                    );
                    return None;
                }

                (
                    ResolvedExprKind::Binary {
                        left: Box::new(left),
                        op: *op,
                        right: Box::new(right),
                    },
                    Type::Number,
                )
            }
            ExprKind::Unary(op, operand) => {
                let operand = self.resolve_expr(operand)?;
                if operand.ty == Type::Void {
                    self.error(
                        "void expression cannot be used as an operand to unary operator"
                            .to_string(),
                        operand.span,
                    );
                    return None;
                }

                (
                    ResolvedExprKind::Unary {
                        op: *op,
                        expr: Box::new(operand),
                    },
                    Type::Number,
                )
            }
            ExprKind::Grouping(inner) => {
                let inner = self.resolve_expr(inner)?;
                let ty = inner.ty;
                (ResolvedExprKind::Grouping(Box::new(inner)), ty)
            }
        };

        Some(ResolvedExpr {
            kind,
            ty,
            span: expr.span,
        })
    }

    fn resolve_decl_ref(&mut self, ident: &Ident, in_call: bool) -> Option<DeclId> {
        let Some((decl, _)) = self.lookup(&ident.name) else {
            self.error(format!("symbol '{}' not found", ident.name), ident.span);
            return None;
        };

        if !in_call && matches!(self.decls[decl.index()].kind, DeclKind::Function(_)) {
            self.error(
                format!("expected to call function '{}'", ident.name),
                ident.span,
            );
            return None;
        }

        Some(decl)
    }

    fn resolve_call(&mut self, call: &Expr, callee: &Ident, args: &[Expr]) -> Option<ResolvedExpr> {
        let decl = self.resolve_decl_ref(callee, true)?;
        let DeclKind::Function(fn_id) = self.decls[decl.index()].kind else {
            self.error("calling non-function symbol".to_string(), call.span);
            return None;
        };

        let (params, return_type) = {
            let function = &self.functions[fn_id.index()];
            (function.params.clone(), function.return_type)
        };

        if args.len() != params.len() {
            self.error(
                "argument count mismatch in function call".to_string(),
                call.span,
            );
            return None;
        }

        let mut resolved_args = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(&params) {
            let arg = self.resolve_expr(arg)?;
            if arg.ty != self.decls[param.index()].ty {
                self.error("unexpected type of argument".to_string(), arg.span);
                return None;
            }
            resolved_args.push(arg);
        }

        Some(ResolvedExpr {
            kind: ResolvedExprKind::Call {
                callee: fn_id,
                args: resolved_args,
            },
            ty: return_type,
            span: call.span,
        })
    }
}

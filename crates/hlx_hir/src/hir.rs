//! Resolved tree - same shape as the AST, but typed and bound to declarations

use hlx_ast::{BinOp, UnaryOp};
use hlx_lexer::Span;

/// Index of a declaration in `ResolvedProgram::decls`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

impl DeclId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a function in `ResolvedProgram::functions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnId(pub u32);

impl FnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The only types a resolved node can have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Void,
    Number,
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Number => write!(f, "number"),
        }
    }
}

/// Kind of declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Function(FnId),
    Param,
    Var { is_mutable: bool },
}

/// Information about a declaration
#[derive(Debug, Clone)]
pub struct DeclInfo {
    pub id: DeclId,
    pub name: String,
    pub kind: DeclKind,
    /// Return type for functions
    pub ty: Type,
    pub span: Span,
}

/// The resolved program. Functions are ordered with the builtin `println`
/// first, then user functions in source order.
#[derive(Debug, Default)]
pub struct ResolvedProgram {
    pub decls: Vec<DeclInfo>,
    pub functions: Vec<ResolvedFunction>,
}

#[derive(Debug, Clone)]
pub struct ResolvedFunction {
    pub id: FnId,
    pub decl: DeclId,
    pub name: String,
    pub params: Vec<DeclId>,
    pub return_type: Type,
    pub body: ResolvedBlock,
    /// Has no source body; lowering supplies one
    pub is_builtin: bool,
    pub span: Span,
}

/// Resolved block
#[derive(Debug, Clone, Default)]
pub struct ResolvedBlock {
    pub stmts: Vec<ResolvedStmt>,
    pub span: Span,
}

/// Resolved statement
#[derive(Debug, Clone)]
pub enum ResolvedStmt {
    Return {
        value: Option<ResolvedExpr>,
        span: Span,
    },
    If {
        cond: ResolvedExpr,
        then_block: ResolvedBlock,
        else_block: Option<ResolvedBlock>,
        span: Span,
    },
    While {
        cond: ResolvedExpr,
        body: ResolvedBlock,
        span: Span,
    },
    Decl {
        decl: DeclId,
        init: Option<ResolvedExpr>,
        span: Span,
    },
    Assign {
        target: DeclId,
        value: ResolvedExpr,
        span: Span,
    },
    Expr(ResolvedExpr),
}

/// Resolved expression
#[derive(Debug, Clone)]
pub struct ResolvedExpr {
    pub kind: ResolvedExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ResolvedExprKind {
    Number(f64),

    /// Parameter or variable reference
    DeclRef(DeclId),

    Call {
        callee: FnId,
        args: Vec<ResolvedExpr>,
    },

    Binary {
        left: Box<ResolvedExpr>,
        op: BinOp,
        right: Box<ResolvedExpr>,
    },

    Unary {
        op: UnaryOp,
        expr: Box<ResolvedExpr>,
    },

    Grouping(Box<ResolvedExpr>),
}

impl ResolvedProgram {
    pub fn decl(&self, id: DeclId) -> &DeclInfo {
        &self.decls[id.index()]
    }

    pub fn function(&self, id: FnId) -> &ResolvedFunction {
        &self.functions[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<&ResolvedFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Stable dump: functions and declarations are tagged with their arena index
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        for function in &self.functions {
            out.push_str(&self.pretty_print_function(function, 0));
        }
        out
    }

    fn pretty_print_function(&self, function: &ResolvedFunction, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        let mut out = format!(
            "{}ResolvedFunctionDecl: @({}) {}:\n",
            ind, function.id.0, function.name
        );
        for &param in &function.params {
            out.push_str(&format!(
                "{}  ResolvedParamDecl: @({}) {}:\n",
                ind,
                param.0,
                self.decl(param).name
            ));
        }
        out.push_str(&self.pretty_print_block(&function.body, indent + 1));
        out
    }

    fn pretty_print_block(&self, block: &ResolvedBlock, indent: usize) -> String {
        let mut out = format!("{}ResolvedBlock\n", "  ".repeat(indent));
        for stmt in &block.stmts {
            out.push_str(&self.pretty_print_stmt(stmt, indent + 1));
        }
        out
    }

    fn pretty_print_stmt(&self, stmt: &ResolvedStmt, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        match stmt {
            ResolvedStmt::Return { value, .. } => {
                let mut out = format!("{}ResolvedReturnStmt\n", ind);
                if let Some(value) = value {
                    out.push_str(&self.pretty_print_expr(value, indent + 1));
                }
                out
            }
            ResolvedStmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                let mut out = format!("{}ResolvedIfStmt\n", ind);
                out.push_str(&self.pretty_print_expr(cond, indent + 1));
                out.push_str(&self.pretty_print_block(then_block, indent + 1));
                if let Some(else_block) = else_block {
                    out.push_str(&self.pretty_print_block(else_block, indent + 1));
                }
                out
            }
            ResolvedStmt::While { cond, body, .. } => {
                let mut out = format!("{}ResolvedWhileStmt\n", ind);
                out.push_str(&self.pretty_print_expr(cond, indent + 1));
                out.push_str(&self.pretty_print_block(body, indent + 1));
                out
            }
            ResolvedStmt::Decl { decl, init, .. } => {
                let mut out = format!("{}ResolvedDeclStmt\n", ind);
                out.push_str(&format!(
                    "{}  ResolvedVarDecl: @({}) {}:\n",
                    ind,
                    decl.0,
                    self.decl(*decl).name
                ));
                if let Some(init) = init {
                    out.push_str(&self.pretty_print_expr(init, indent + 2));
                }
                out
            }
            ResolvedStmt::Assign { target, value, .. } => {
                let mut out = format!("{}ResolvedAssignment\n", ind);
                out.push_str(&format!(
                    "{}  ResolvedDeclRefExpr: @({}) {}\n",
                    ind,
                    target.0,
                    self.decl(*target).name
                ));
                out.push_str(&self.pretty_print_expr(value, indent + 1));
                out
            }
            ResolvedStmt::Expr(expr) => self.pretty_print_expr(expr, indent),
        }
    }

    fn pretty_print_expr(&self, expr: &ResolvedExpr, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        match &expr.kind {
            ResolvedExprKind::Number(value) => {
                format!("{}ResolvedNumberLiteral: '{}'\n", ind, value)
            }
            ResolvedExprKind::DeclRef(decl) => format!(
                "{}ResolvedDeclRefExpr: @({}) {}\n",
                ind,
                decl.0,
                self.decl(*decl).name
            ),
            ResolvedExprKind::Call { callee, args } => {
                let callee = self.function(*callee);
                let mut out = format!(
                    "{}ResolvedCallExpr: @({}) {}\n",
                    ind, callee.id.0, callee.name
                );
                for arg in args {
                    out.push_str(&self.pretty_print_expr(arg, indent + 1));
                }
                out
            }
            ResolvedExprKind::Binary { left, op, right } => {
                let mut out = format!("{}ResolvedBinaryOperator: '{}'\n", ind, op);
                out.push_str(&self.pretty_print_expr(left, indent + 1));
                out.push_str(&self.pretty_print_expr(right, indent + 1));
                out
            }
            ResolvedExprKind::Unary { op, expr } => {
                let mut out = format!("{}ResolvedUnaryOperator: '{}'\n", ind, op);
                out.push_str(&self.pretty_print_expr(expr, indent + 1));
                out
            }
            ResolvedExprKind::Grouping(inner) => {
                let mut out = format!("{}ResolvedGroupingExpr:\n", ind);
                out.push_str(&self.pretty_print_expr(inner, indent + 1));
                out
            }
        }
    }
}

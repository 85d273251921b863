use hlx_lexer::Span;

/// A complete .hlx source file: only function definitions live at the top level
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    pub functions: Vec<FunctionDecl>,
}

/// Function definition: `fn name(params): type { ... }`
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: Ident,
    pub params: Vec<ParamDecl>,
    pub return_type: TypeSpec,
    pub body: Block,
    pub span: Span,
}

/// Function parameter
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: Ident,
    pub ty: TypeSpec,
    pub span: Span,
}

/// `let`/`var` declaration
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Ident,
    pub ty: Option<TypeSpec>,
    /// `var` bindings are mutable, `let` bindings are not
    pub is_mutable: bool,
    pub init: Option<Expr>,
    pub span: Span,
}

/// A block of statements. Every block opens a scope.
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

/// Statements
#[derive(Debug, Clone)]
pub enum Stmt {
    Return(ReturnStmt),
    If(IfStmt),
    While(WhileStmt),
    Decl(DeclStmt),
    Assign(Assignment),
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Return(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::Decl(s) => s.span,
            Stmt::Assign(s) => s.span,
            Stmt::Expr(e) => e.span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReturnStmt {
    pub value: Option<Expr>,
    pub span: Span,
}

/// `if cond { } else { }`. An `else if` is stored as a false block holding
/// a single nested `IfStmt`.
#[derive(Debug, Clone)]
pub struct IfStmt {
    pub condition: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct WhileStmt {
    pub condition: Expr,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DeclStmt {
    pub var: VarDecl,
    pub span: Span,
}

/// Assignment: `x = expr;`
#[derive(Debug, Clone)]
pub struct Assignment {
    pub target: Ident,
    pub value: Expr,
    pub span: Span,
}

/// Expressions
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Number literal, as written: 3.14
    NumberLiteral(String),
    /// Reference to a declaration: foo
    DeclRef(Ident),
    /// Function call: foo(a, b)
    Call(Ident, Vec<Expr>),
    /// Binary operation: a + b
    Binary(Box<Expr>, BinOp, Box<Expr>),
    /// Unary operation: -x, !x
    Unary(UnaryOp, Box<Expr>),
    /// Parenthesized expression: (a)
    Grouping(Box<Expr>),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparison
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    // Logical
    And,
    Or,
}

impl BinOp {
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::NotEq => 3,
            BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
        }
    }

    /// `&&` and `||` evaluate their right operand conditionally
    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinOp::Add => write!(f, "+"),
            BinOp::Sub => write!(f, "-"),
            BinOp::Mul => write!(f, "*"),
            BinOp::Div => write!(f, "/"),
            BinOp::Mod => write!(f, "%"),
            BinOp::Eq => write!(f, "=="),
            BinOp::NotEq => write!(f, "!="),
            BinOp::Lt => write!(f, "<"),
            BinOp::Gt => write!(f, ">"),
            BinOp::LtEq => write!(f, "<="),
            BinOp::GtEq => write!(f, ">="),
            BinOp::And => write!(f, "&&"),
            BinOp::Or => write!(f, "||"),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg, // -
    Not, // !
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

/// Type as written in the source
#[derive(Debug, Clone)]
pub struct TypeSpec {
    pub kind: TypeKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Number,
    /// Any other identifier. No user-defined types exist, so this never resolves.
    Custom(String),
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Number => write!(f, "number"),
            TypeKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Identifier with span
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: String, span: Span) -> Self {
        Self { name, span }
    }
}

// === Pretty Printing ===

impl SourceFile {
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        for function in &self.functions {
            out.push_str(&function.pretty_print(0));
        }
        out
    }
}

impl FunctionDecl {
    pub fn pretty_print(&self, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        let mut out = format!("{}FunctionDecl: {}:{}\n", ind, self.name.name, self.return_type.kind);
        for param in &self.params {
            out.push_str(&format!(
                "{}  ParamDecl: {}:{}\n",
                ind, param.name.name, param.ty.kind
            ));
        }
        out.push_str(&self.body.pretty_print(indent + 1));
        out
    }
}

impl VarDecl {
    pub fn pretty_print(&self, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        let ty = self.ty.as_ref().map(|t| t.kind.to_string()).unwrap_or_default();
        let keyword = if self.is_mutable { "var" } else { "let" };
        let mut out = format!("{}VarDecl: {}:{} {}\n", ind, self.name.name, ty, keyword);
        if let Some(init) = &self.init {
            out.push_str(&init.pretty_print(indent + 1));
        }
        out
    }
}

impl Block {
    pub fn pretty_print(&self, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        let mut out = format!("{}Block\n", ind);
        for stmt in &self.stmts {
            out.push_str(&stmt.pretty_print(indent + 1));
        }
        out
    }
}

impl Stmt {
    pub fn pretty_print(&self, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        match self {
            Stmt::Return(r) => {
                let mut out = format!("{}ReturnStmt\n", ind);
                if let Some(value) = &r.value {
                    out.push_str(&value.pretty_print(indent + 1));
                }
                out
            }
            Stmt::If(s) => {
                let mut out = format!("{}IfStmt\n", ind);
                out.push_str(&s.condition.pretty_print(indent + 1));
                out.push_str(&s.then_block.pretty_print(indent + 1));
                if let Some(else_block) = &s.else_block {
                    out.push_str(&else_block.pretty_print(indent + 1));
                }
                out
            }
            Stmt::While(w) => {
                let mut out = format!("{}WhileStmt\n", ind);
                out.push_str(&w.condition.pretty_print(indent + 1));
                out.push_str(&w.body.pretty_print(indent + 1));
                out
            }
            Stmt::Decl(d) => {
                let mut out = format!("{}DeclStmt\n", ind);
                out.push_str(&d.var.pretty_print(indent + 1));
                out
            }
            Stmt::Assign(a) => {
                let mut out = format!("{}Assignment\n", ind);
                out.push_str(&format!("{}  DeclRefExpr: '{}'\n", ind, a.target.name));
                out.push_str(&a.value.pretty_print(indent + 1));
                out
            }
            Stmt::Expr(e) => e.pretty_print(indent),
        }
    }
}

impl Expr {
    pub fn pretty_print(&self, indent: usize) -> String {
        let ind = "  ".repeat(indent);
        match &self.kind {
            ExprKind::NumberLiteral(n) => format!("{}NumberLiteral: '{}'\n", ind, n),
            ExprKind::DeclRef(id) => format!("{}DeclRefExpr: '{}'\n", ind, id.name),
            ExprKind::Call(callee, args) => {
                let mut out = format!("{}CallExpr:\n", ind);
                out.push_str(&format!("{}  DeclRefExpr: '{}'\n", ind, callee.name));
                for arg in args {
                    out.push_str(&arg.pretty_print(indent + 1));
                }
                out
            }
            ExprKind::Binary(l, op, r) => {
                let mut out = format!("{}BinaryOperator: '{}'\n", ind, op);
                out.push_str(&l.pretty_print(indent + 1));
                out.push_str(&r.pretty_print(indent + 1));
                out
            }
            ExprKind::Unary(op, e) => {
                let mut out = format!("{}UnaryOperator: '{}'\n", ind, op);
                out.push_str(&e.pretty_print(indent + 1));
                out
            }
            ExprKind::Grouping(e) => {
                let mut out = format!("{}GroupingExpr:\n", ind);
                out.push_str(&e.pretty_print(indent + 1));
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Ident {
        Ident::new(name.to_string(), Span::default())
    }

    fn expr(kind: ExprKind) -> Expr {
        Expr { kind, span: Span::default() }
    }

    fn number(text: &str) -> Expr {
        expr(ExprKind::NumberLiteral(text.to_string()))
    }

    #[test]
    fn test_precedence_table() {
        assert!(BinOp::Or.precedence() < BinOp::And.precedence());
        assert!(BinOp::And.precedence() < BinOp::Eq.precedence());
        assert_eq!(BinOp::Eq.precedence(), BinOp::NotEq.precedence());
        assert!(BinOp::NotEq.precedence() < BinOp::Lt.precedence());
        assert_eq!(BinOp::Lt.precedence(), BinOp::GtEq.precedence());
        assert!(BinOp::GtEq.precedence() < BinOp::Add.precedence());
        assert!(BinOp::Sub.precedence() < BinOp::Mod.precedence());
        assert!(BinOp::And.is_short_circuit());
        assert!(!BinOp::Mul.is_short_circuit());
    }

    #[test]
    fn test_pretty_print_function() {
        let body = Block {
            stmts: vec![
                Stmt::Decl(DeclStmt {
                    var: VarDecl {
                        name: ident("x"),
                        ty: None,
                        is_mutable: true,
                        init: Some(number("1")),
                        span: Span::default(),
                    },
                    span: Span::default(),
                }),
                Stmt::Return(ReturnStmt {
                    value: Some(expr(ExprKind::Binary(
                        Box::new(expr(ExprKind::DeclRef(ident("x")))),
                        BinOp::Add,
                        Box::new(expr(ExprKind::Call(ident("f"), vec![number("2")]))),
                    ))),
                    span: Span::default(),
                }),
            ],
            span: Span::default(),
        };
        let function = FunctionDecl {
            name: ident("g"),
            params: vec![ParamDecl {
                name: ident("n"),
                ty: TypeSpec { kind: TypeKind::Number, span: Span::default() },
                span: Span::default(),
            }],
            return_type: TypeSpec { kind: TypeKind::Number, span: Span::default() },
            body,
            span: Span::default(),
        };

        let expected = "\
FunctionDecl: g:number
  ParamDecl: n:number
  Block
    DeclStmt
      VarDecl: x: var
        NumberLiteral: '1'
    ReturnStmt
      BinaryOperator: '+'
        DeclRefExpr: 'x'
        CallExpr:
          DeclRefExpr: 'f'
          NumberLiteral: '2'
";
        assert_eq!(function.pretty_print(0), expected);
    }

    #[test]
    fn test_custom_type_displays_its_name() {
        assert_eq!(TypeKind::Custom("Point".to_string()).to_string(), "Point");
        assert_eq!(TypeKind::Void.to_string(), "void");
    }
}

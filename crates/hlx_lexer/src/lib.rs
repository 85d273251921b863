use logos::Logos;

/// Span in source code (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Span covering both `self` and `other`
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// A token with its span
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f\v]+")] // Skip whitespace
#[logos(skip r"//[^\n]*")] // Skip line comments
pub enum Token {
    // === Keywords ===
    #[token("fn")]
    Fn,
    #[token("void")]
    Void,
    #[token("number")]
    NumberType,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("let")]
    Let,
    #[token("var")]
    Var,

    // === Literals ===
    /// Kept as written; the resolver converts it to a value.
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().to_string())]
    Number(String),

    // === Identifiers ===
    #[regex(r"[a-zA-Z][a-zA-Z0-9]*", |lex| lex.slice().to_string())]
    Ident(String),

    // === Operators ===
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("=")]
    Eq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Not,

    // === Delimiters ===
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,

    // === Punctuation ===
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,

    // === Special ===
    /// A character no rule accepts. Reported by the parser, not the lexer.
    Unknown(String),
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Fn => write!(f, "fn"),
            Token::Void => write!(f, "void"),
            Token::NumberType => write!(f, "number"),
            Token::Return => write!(f, "return"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::Let => write!(f, "let"),
            Token::Var => write!(f, "var"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eq => write!(f, "="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semi => write!(f, ";"),
            Token::Unknown(s) => write!(f, "{}", s),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Pull-based token source. After the input is exhausted every call yields `Eof`.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, Token>,
    finished: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            inner: Token::lexer(source),
            finished: false,
        }
    }

    /// Tokenize the entire source into a Vec, `Eof` included
    pub fn tokenize(source: &str) -> Vec<SpannedToken> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();

        loop {
            let spanned = lexer.next_token();
            let is_eof = spanned.token == Token::Eof;
            tokens.push(spanned);
            if is_eof {
                break;
            }
        }

        tokens
    }

    pub fn next_token(&mut self) -> SpannedToken {
        let len = self.inner.source().len();
        if self.finished {
            return SpannedToken {
                token: Token::Eof,
                span: Span::new(len, len),
            };
        }

        match self.inner.next() {
            Some(Ok(token)) => {
                let span = self.inner.span();
                SpannedToken {
                    token,
                    span: Span::new(span.start, span.end),
                }
            }
            Some(Err(())) => {
                let span = self.inner.span();
                SpannedToken {
                    token: Token::Unknown(self.inner.slice().to_string()),
                    span: Span::new(span.start, span.end),
                }
            }
            None => {
                self.finished = true;
                SpannedToken {
                    token: Token::Eof,
                    span: Span::new(len, len),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokens() {
        let source = "fn main(): void { let x = 5; }";
        let tokens = Lexer::tokenize(source);

        assert!(matches!(tokens[0].token, Token::Fn));
        assert!(matches!(tokens[1].token, Token::Ident(ref s) if s == "main"));
        assert!(matches!(tokens[2].token, Token::LParen));
        assert!(matches!(tokens[3].token, Token::RParen));
        assert!(matches!(tokens[4].token, Token::Colon));
        assert!(matches!(tokens[5].token, Token::Void));
        assert!(matches!(tokens[6].token, Token::LBrace));
        assert!(matches!(tokens[7].token, Token::Let));
        assert!(matches!(tokens[8].token, Token::Ident(ref s) if s == "x"));
        assert!(matches!(tokens[9].token, Token::Eq));
        assert!(matches!(tokens[10].token, Token::Number(ref n) if n == "5"));
        assert!(matches!(tokens[11].token, Token::Semi));
        assert!(matches!(tokens[12].token, Token::RBrace));
        assert!(matches!(tokens[13].token, Token::Eof));
    }

    #[test]
    fn test_operators_prefer_longest_match() {
        let tokens = Lexer::tokenize("<= >= == != && || < = !");
        let kinds: Vec<_> = tokens.into_iter().map(|t| t.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::LtEq,
                Token::GtEq,
                Token::EqEq,
                Token::NotEq,
                Token::AndAnd,
                Token::OrOr,
                Token::Lt,
                Token::Eq,
                Token::Not,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals_keep_text() {
        let tokens = Lexer::tokenize("3.14 42 007");
        assert!(matches!(tokens[0].token, Token::Number(ref n) if n == "3.14"));
        assert!(matches!(tokens[1].token, Token::Number(ref n) if n == "42"));
        assert!(matches!(tokens[2].token, Token::Number(ref n) if n == "007"));
    }

    #[test]
    fn test_keywords_are_not_identifiers() {
        let tokens = Lexer::tokenize("number numbers var variable");
        assert!(matches!(tokens[0].token, Token::NumberType));
        assert!(matches!(tokens[1].token, Token::Ident(ref s) if s == "numbers"));
        assert!(matches!(tokens[2].token, Token::Var));
        assert!(matches!(tokens[3].token, Token::Ident(ref s) if s == "variable"));
    }

    #[test]
    fn test_comments_and_unknown_characters() {
        let tokens = Lexer::tokenize("x // trailing words\n $ y");
        assert!(matches!(tokens[0].token, Token::Ident(ref s) if s == "x"));
        assert!(matches!(tokens[1].token, Token::Unknown(ref s) if s == "$"));
        assert_eq!(tokens[1].span, Span::new(21, 22));
        assert!(matches!(tokens[2].token, Token::Ident(ref s) if s == "y"));
        assert!(matches!(tokens[3].token, Token::Eof));
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut lexer = Lexer::new("x");
        lexer.next_token();
        assert_eq!(lexer.next_token().token, Token::Eof);
        let again = lexer.next_token();
        assert_eq!(again.token, Token::Eof);
        assert_eq!(again.span, Span::new(1, 1));
    }
}

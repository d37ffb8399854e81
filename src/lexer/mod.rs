use logos::Logos;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip("//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*[^*]*\*+([^/*][^*]*\*+)*/")]
pub enum TokenKind {
    // Keywords
    #[token("local")]
    Local,
    #[token("const")]
    Const,
    #[token("function")]
    Function,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("null")]
    Null,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,

    // Operators — longest match wins, logos handles the overlaps
    #[token("=")]
    Assign,
    #[token("+=")]
    AddAssign,
    #[token("-=")]
    SubAssign,
    #[token("*=")]
    MulAssign,
    #[token("/=")]
    DivAssign,
    #[token("++")]
    Increment,
    #[token("--")]
    Decrement,
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
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtE,
    #[token(">=")]
    GtE,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    ShiftLeft,
    #[token(">>")]
    ShiftRight,

    // Literals
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].to_string())
    })]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),
}

/// A token paired with the 1-based source line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

/// Lex source text into tokens. Characters that match nothing are skipped —
/// the language treats stray bytes as noise rather than hard errors; the
/// parser reports anything structurally wrong.
pub fn lex(source: &str) -> Vec<Token> {
    let mut lexer = TokenKind::lexer(source);
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut cursor = 0usize;

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        line += source[cursor..span.start].matches('\n').count() as u32;
        cursor = span.start;
        if let Ok(kind) = result {
            tokens.push(Token { kind, line });
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_local_declaration() {
        let toks = kinds("local x = 5;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Local,
                TokenKind::Name("x".into()),
                TokenKind::Assign,
                TokenKind::Number(5.0),
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn lex_longest_operator_wins() {
        assert_eq!(kinds("<<"), vec![TokenKind::ShiftLeft]);
        assert_eq!(kinds("<= <"), vec![TokenKind::LtE, TokenKind::Lt]);
        assert_eq!(kinds("+= +"), vec![TokenKind::AddAssign, TokenKind::Plus]);
        assert_eq!(kinds("..."), vec![TokenKind::Ellipsis]);
    }

    #[test]
    fn lex_string_literal() {
        assert_eq!(kinds(r#""hello there""#), vec![TokenKind::Str("hello there".into())]);
    }

    #[test]
    fn lex_comments_skipped() {
        let toks = kinds("1 // comment\n2 /* block\ncomment */ 3");
        assert_eq!(
            toks,
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Number(3.0)]
        );
    }

    #[test]
    fn lex_malformed_characters_skipped() {
        // `@` and `$` match nothing; the surrounding tokens survive
        let toks = kinds("local @ x $ = 1;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Local,
                TokenKind::Name("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.0),
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn lex_tracks_lines() {
        let toks = lex("local a = 1;\nlocal b = 2;\n\nreturn a;");
        assert_eq!(toks[0].line, 1);
        let b_decl: Vec<&Token> =
            toks.iter().filter(|t| t.kind == TokenKind::Name("b".into())).collect();
        assert_eq!(b_decl[0].line, 2);
        let ret: Vec<&Token> = toks.iter().filter(|t| t.kind == TokenKind::Return).collect();
        assert_eq!(ret[0].line, 4);
    }

    #[test]
    fn lex_fractional_numbers() {
        assert_eq!(kinds("3.25"), vec![TokenKind::Number(3.25)]);
    }
}

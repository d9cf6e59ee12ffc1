// Token scanner for the MXVM intermediate representation.
//
// Newlines terminate statements in the IR, so NEWLINE is a token kind of
// its own rather than discarded whitespace. Line comments survive the scan
// as COMMENT tokens carrying their full text, which lets the parser keep
// them in the AST and the printer reproduce them.

use crate::error::{Error, Location, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Id,
    Num,
    Str,
    Sym,
    Newline,
    Comment,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
    pub col: u32,
}

impl Token {
    pub fn location(&self, file: &str) -> Location {
        Location::new(file, self.line, self.col)
    }
}

pub struct Lexer {
    file: String,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
}

const PUNCTUATION: &[char] = &['{', '}', ',', '=', ':', '(', ')'];

impl Lexer {
    pub fn new(file: &str, source: &str) -> Lexer {
        Lexer {
            file: file.to_string(),
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn scan(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                '\n' => {
                    self.advance();
                    tokens.push(self.token(TokenKind::Newline, "\n", line, col));
                }
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '/' if self.peek_at(1) == Some('/') => {
                    let text = self.scan_comment();
                    tokens.push(self.token(TokenKind::Comment, &text, line, col));
                }
                '"' => {
                    let text = self.scan_string()?;
                    tokens.push(self.token(TokenKind::Str, &text, line, col));
                }
                c if c.is_ascii_digit() => {
                    let text = self.scan_number()?;
                    tokens.push(self.token(TokenKind::Num, &text, line, col));
                }
                '+' | '-' if self.starts_number() => {
                    let text = self.scan_number()?;
                    tokens.push(self.token(TokenKind::Num, &text, line, col));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let text = self.scan_identifier();
                    tokens.push(self.token(TokenKind::Id, &text, line, col));
                }
                c if PUNCTUATION.contains(&c) => {
                    self.advance();
                    tokens.push(self.token(TokenKind::Sym, &c.to_string(), line, col));
                }
                c => {
                    return Err(self.error(format!("UnknownChar `{}`", c)));
                }
            }
        }
        let (line, col) = (self.line, self.col);
        tokens.push(self.token(TokenKind::Eof, "", line, col));
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    // A sign starts a number only when a digit (or a decimal point
    // followed by a digit) comes next.
    fn starts_number(&self) -> bool {
        match self.peek_at(1) {
            Some(c) if c.is_ascii_digit() => true,
            Some('.') => matches!(self.peek_at(2), Some(c) if c.is_ascii_digit()),
            _ => false,
        }
    }

    fn scan_comment(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            text.push(c);
            self.advance();
        }
        text
    }

    fn scan_string(&mut self) -> Result<String> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(self.error("UnterminatedString".to_string()));
                }
                Some('"') => {
                    self.advance();
                    return Ok(text);
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('\\') => text.push('\\'),
                        Some('"') => text.push('"'),
                        Some(c) => {
                            return Err(
                                self.error(format!("UnknownChar `\\{}` in string", c))
                            );
                        }
                        None => {
                            return Err(self.error("UnterminatedString".to_string()));
                        }
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
            }
        }
    }

    fn scan_number(&mut self) -> Result<String> {
        let mut text = String::new();
        if let Some(c) = self.peek() {
            if c == '+' || c == '-' {
                text.push(c);
                self.advance();
            }
        }
        let mut seen_dot = false;
        let mut seen_digit = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                seen_digit = true;
                text.push(c);
                self.advance();
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if !seen_digit {
            return Err(self.error(format!("InvalidNumber `{}`", text)));
        }
        // A number running straight into an identifier is a typo, not two
        // tokens.
        if let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                return Err(self.error(format!("InvalidNumber `{}{}`", text, c)));
            }
        }
        Ok(text)
    }

    // Dots are identifier characters so qualified names like
    // `object.label` stay one token.
    fn scan_identifier(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        text
    }

    fn token(&self, kind: TokenKind, lexeme: &str, line: u32, col: u32) -> Token {
        Token {
            kind,
            lexeme: lexeme.to_string(),
            line,
            col,
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::Lex {
            loc: Location::new(&self.file, self.line, self.col),
            msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Vec<Token> {
        Lexer::new("test.mxvm", text).scan().unwrap()
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        use TokenKind::*;
        let tokens = scan("mov a, 5\n");
        assert_eq!(kinds(&tokens), vec![Id, Id, Sym, Num, Newline, Eof]);
        assert_eq!(tokens[0].lexeme, "mov");
        assert_eq!(tokens[3].lexeme, "5");
    }

    #[test]
    fn test_positions() {
        let tokens = scan("a\n  b\n");
        assert_eq!((tokens[0].line, tokens[0].col), (1, 1));
        assert_eq!((tokens[2].line, tokens[2].col), (2, 3));
    }

    #[test]
    fn test_signed_numbers() {
        let tokens = scan("-3 +2.5 1.0");
        assert_eq!(tokens[0].lexeme, "-3");
        assert_eq!(tokens[1].lexeme, "+2.5");
        assert_eq!(tokens[2].lexeme, "1.0");
        assert!(tokens[..3].iter().all(|t| t.kind == TokenKind::Num));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = scan(r#""a\n\t\"\\b""#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "a\n\t\"\\b");
    }

    #[test]
    fn test_qualified_identifier() {
        let tokens = scan("call stdio.print_line");
        assert_eq!(tokens[1].kind, TokenKind::Id);
        assert_eq!(tokens[1].lexeme, "stdio.print_line");
    }

    #[test]
    fn test_comment_preserved() {
        let tokens = scan("// a comment\nmov");
        assert_eq!(tokens[0].kind, TokenKind::Comment);
        assert_eq!(tokens[0].lexeme, "// a comment");
        assert_eq!(tokens[1].kind, TokenKind::Newline);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("t.mxvm", "\"abc\n").scan().unwrap_err();
        assert!(format!("{}", err).contains("UnterminatedString"));
    }

    #[test]
    fn test_invalid_number() {
        let err = Lexer::new("t.mxvm", "12abc").scan().unwrap_err();
        assert!(format!("{}", err).contains("InvalidNumber"));
    }

    #[test]
    fn test_unknown_char() {
        let err = Lexer::new("t.mxvm", "mov a, $5").scan().unwrap_err();
        assert!(format!("{}", err).contains("UnknownChar"));
    }

    #[test]
    fn test_minus_alone_is_an_error() {
        // `-` not followed by a digit cannot start anything in the IR.
        let err = Lexer::new("t.mxvm", "a - b").scan().unwrap_err();
        assert!(format!("{}", err).contains("UnknownChar"));
    }
}

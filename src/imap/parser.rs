//-
// Copyright (c) 2024, The Archiveopteryx Developers
//
// This file is part of Archiveopteryx.
//
// Archiveopteryx is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Archiveopteryx is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
// or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Archiveopteryx. If not, see <http://www.gnu.org/licenses/>.

//! Token-level parsing of IMAP command text.
//!
//! A `Parser` owns the complete text of one command, i.e. the first line
//! plus any literals the framer has already read, with each literal's
//! bytes inline right after its `{N}` marker. Token accessors step a
//! cursor through that text; they are fallible and the command machinery
//! turns the first error into a tagged BAD.

use std::fmt;

use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"\{([0-9]+)(\+?)\}$"#).unwrap();
}

/// The largest command line the server accepts, per RFC 2822's stance on
/// line lengths; longer lines close the connection.
pub const MAX_LINE: usize = 4096;

/// Checks whether a line ends with a literal announcement, returning the
/// octet count and whether it is a LITERAL+ (non-synchronising) literal.
pub fn ends_with_literal(line: &[u8]) -> Option<(u32, bool)> {
    let captures = LITERAL_AT_EOL.captures(line)?;
    let n = std::str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse::<u32>()
        .ok()?;
    Some((n, !captures.get(2)?.as_bytes().is_empty()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn err<T>(message: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError {
        message: message.into(),
    })
}

pub struct Parser {
    text: Vec<u8>,
    pos: usize,
}

impl Parser {
    pub fn new(text: Vec<u8>) -> Self {
        Parser { text, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    pub fn next_char(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    pub fn step(&mut self) {
        self.pos += 1;
    }

    pub fn require(&mut self, expected: &str) -> Result<(), ParseError> {
        if self.text[self.pos..].starts_with(expected.as_bytes()) {
            self.pos += expected.len();
            Ok(())
        } else {
            err(format!("expected {:?}", expected))
        }
    }

    pub fn space(&mut self) -> Result<(), ParseError> {
        self.require(" ")
    }

    pub fn end(&mut self) -> Result<(), ParseError> {
        if self.at_end() {
            Ok(())
        } else {
            err(format!(
                "garbage at end of command: {:?}",
                String::from_utf8_lossy(
                    &self.text[self.pos..self.text.len().min(self.pos + 16)],
                ),
            ))
        }
    }

    /// A tag: any astring-ish characters except '+'.
    pub fn tag(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(c) = self.next_char() {
            if c <= b' '
                || c >= 0x7f
                || matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+')
            {
                break;
            }
            self.step();
        }
        if self.pos == start {
            return err("expected a tag");
        }
        Ok(String::from_utf8_lossy(&self.text[start..self.pos])
            .into_owned())
    }

    /// A command name: one atom, lowercased.
    pub fn command(&mut self) -> Result<String, ParseError> {
        let word = self.atom()?;
        Ok(word.to_ascii_lowercase())
    }

    pub fn atom(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(c) = self.next_char() {
            if c <= b' '
                || c >= 0x7f
                || matches!(
                    c,
                    b'(' | b')'
                        | b'{'
                        | b'%'
                        | b'*'
                        | b'"'
                        | b'\\'
                        | b'['
                        | b']',
                )
            {
                break;
            }
            self.step();
        }
        if self.pos == start {
            return err("expected an atom");
        }
        Ok(String::from_utf8_lossy(&self.text[start..self.pos])
            .into_owned())
    }

    /// number: 0 .. 2^32-1.
    pub fn number(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        while self.next_char().is_some_and(|c| c.is_ascii_digit()) {
            self.step();
        }
        if self.pos == start {
            return err("expected a number");
        }
        std::str::from_utf8(&self.text[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map_or_else(|| err("number out of range"), Ok)
    }

    /// nz-number: 1 .. 2^32-1.
    pub fn nz_number(&mut self) -> Result<u32, ParseError> {
        let n = self.number()?;
        if n == 0 {
            return err("expected a nonzero number");
        }
        Ok(n)
    }

    pub fn quoted(&mut self) -> Result<Vec<u8>, ParseError> {
        self.require("\"")?;
        let mut out = Vec::new();
        loop {
            match self.next_char() {
                None => return err("unterminated quoted string"),
                Some(b'"') => {
                    self.step();
                    return Ok(out);
                },
                Some(b'\\') => {
                    self.step();
                    match self.next_char() {
                        Some(c @ (b'"' | b'\\')) => {
                            out.push(c);
                            self.step();
                        },
                        _ => return err("bad quoted-string escape"),
                    }
                },
                Some(c @ (b'\r' | b'\n')) => {
                    let _ = c;
                    return err("line break in quoted string");
                },
                Some(c) => {
                    out.push(c);
                    self.step();
                },
            }
        }
    }

    /// A literal whose bytes the framer placed inline after `{N}CRLF`.
    pub fn literal(&mut self) -> Result<Vec<u8>, ParseError> {
        self.require("{")?;
        let n = self.number()? as usize;
        if self.next_char() == Some(b'+') {
            self.step();
        }
        self.require("}")?;
        self.require("\r\n")?;
        if self.text.len() - self.pos < n {
            return err("literal data missing");
        }
        let out = self.text[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// string = quoted / literal.
    pub fn string(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.next_char() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            _ => err("expected a string"),
        }
    }

    /// astring = atom / string.
    pub fn astring(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.next_char() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            _ => self.atom().map(String::into_bytes),
        }
    }

    /// nstring = NIL / string.
    pub fn nstring(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
        if self.text[self.pos..].starts_with(b"NIL")
            || self.text[self.pos..].starts_with(b"nil")
        {
            self.pos += 3;
            return Ok(None);
        }
        self.string().map(Some)
    }

    /// A flag, with or without the leading backslash.
    pub fn flag(&mut self) -> Result<String, ParseError> {
        let mut out = String::new();
        if self.next_char() == Some(b'\\') {
            out.push('\\');
            self.step();
        }
        out.push_str(&self.atom()?);
        Ok(out)
    }

    /// sequence-set, e.g. `1,3:5,7:*`.
    pub fn sequence_set(&mut self) -> Result<SequenceSet, ParseError> {
        let mut ranges = Vec::new();
        loop {
            let first = self.set_element()?;
            let range = if self.next_char() == Some(b':') {
                self.step();
                let second = self.set_element()?;
                (first, second)
            } else {
                (first, first)
            };
            ranges.push(range);

            if self.next_char() == Some(b',') {
                self.step();
            } else {
                break;
            }
        }
        Ok(SequenceSet { ranges })
    }

    fn set_element(&mut self) -> Result<Option<u32>, ParseError> {
        if self.next_char() == Some(b'*') {
            self.step();
            Ok(None)
        } else {
            self.nz_number().map(Some)
        }
    }
}

/// A message set. `None` elements are `*`, resolved against the largest
/// number in the addressed space when the set is expanded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<(Option<u32>, Option<u32>)>,
}

impl SequenceSet {
    pub fn expand(&self, largest: u32) -> Vec<u32> {
        if largest == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            let a = a.unwrap_or(largest);
            let b = b.unwrap_or(largest);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            if lo > largest {
                continue;
            }
            for n in lo..=hi.min(largest) {
                out.push(n);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Expansion without clamping, for UID sets addressing possibly
    /// expunged messages.
    pub fn expand_unclamped(&self, largest: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            let a = a.unwrap_or(largest);
            let b = b.unwrap_or(largest);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for n in lo..=hi {
                out.push(n);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser(s: &str) -> Parser {
        Parser::new(s.as_bytes().to_vec())
    }

    #[test]
    fn literal_detection() {
        assert_eq!(Some((5, false)), ends_with_literal(b"A001 LOGIN {5}"));
        assert_eq!(Some((5, true)), ends_with_literal(b"A001 LOGIN {5+}"));
        assert_eq!(None, ends_with_literal(b"A001 LOGIN foo"));
        assert_eq!(None, ends_with_literal(b"A001 LOGIN {5} "));
        assert_eq!(None, ends_with_literal(b"A001 LOGIN {x}"));
    }

    #[test]
    fn tags_and_atoms() {
        let mut p = parser("A001 LOGIN user pass");
        assert_eq!("A001", p.tag().unwrap());
        p.space().unwrap();
        assert_eq!("login", p.command().unwrap());
        p.space().unwrap();
        assert_eq!("user", p.atom().unwrap());
        p.space().unwrap();
        assert_eq!(b"pass".to_vec(), p.astring().unwrap());
        p.end().unwrap();
    }

    #[test]
    fn tag_rejects_plus() {
        let mut p = parser("+ something");
        assert!(p.tag().is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(0, parser("0").number().unwrap());
        assert_eq!(4294967295, parser("4294967295").number().unwrap());
        assert!(parser("4294967296").number().is_err());
        assert!(parser("x").number().is_err());
        assert!(parser("0").nz_number().is_err());
        assert_eq!(1, parser("1").nz_number().unwrap());
    }

    #[test]
    fn quoted_strings() {
        assert_eq!(b"hello".to_vec(), parser("\"hello\"").quoted().unwrap());
        assert_eq!(
            b"a\"b\\c".to_vec(),
            parser(r#""a\"b\\c""#).quoted().unwrap(),
        );
        assert!(parser("\"unterminated").quoted().is_err());
        assert!(parser("\"bad\nline\"").quoted().is_err());
    }

    #[test]
    fn literals_inline() {
        let mut p = parser("{5}\r\nhelloX");
        assert_eq!(b"hello".to_vec(), p.literal().unwrap());
        assert_eq!(Some(b'X'), p.next_char());

        let mut p = parser("{5+}\r\nhello");
        assert_eq!(b"hello".to_vec(), p.literal().unwrap());
        assert!(p.at_end());

        assert!(parser("{5}\r\nhi").literal().is_err());
    }

    #[test]
    fn nstring() {
        assert_eq!(None, parser("NIL").nstring().unwrap());
        assert_eq!(
            Some(b"x".to_vec()),
            parser("\"x\"").nstring().unwrap(),
        );
    }

    #[test]
    fn sequence_sets() {
        let set = parser("1,3:5,9").sequence_set().unwrap();
        assert_eq!(vec![1, 3, 4, 5, 9], set.expand(100));

        let set = parser("7:*").sequence_set().unwrap();
        assert_eq!(vec![7, 8, 9, 10], set.expand(10));
        // Backwards ranges normalise.
        let set = parser("5:3").sequence_set().unwrap();
        assert_eq!(vec![3, 4, 5], set.expand(10));
        // `*` alone names the largest.
        let set = parser("*").sequence_set().unwrap();
        assert_eq!(vec![42], set.expand(42));

        assert!(parser("0:2").sequence_set().is_err());
        assert!(parser("").sequence_set().is_err());
    }

    #[test]
    fn expand_unclamped_keeps_missing_uids() {
        let set = parser("1:10").sequence_set().unwrap();
        assert_eq!(
            (1..=10).collect::<Vec<u32>>(),
            set.expand_unclamped(4),
        );
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Function body location.
//!
//! Finds the body of a named method inside a class-based source file, e.g., a
//! PHP controller, so that it can be captured or swapped out.
//!
//! # How Matching Works
//!
//! A signature pattern looks for an access modifier, an optional `static`,
//! the `function` keyword, the target name, a parameter list, an optional
//! return type, and finally an opening brace. Starting from that brace, the
//! text is scanned forward while keeping count of brace depth. The body ends
//! where the depth drops back to zero.
//!
//! # Pitfalls
//!
//! This is a heuristic scanner, not a parser:
//!
//! - Parameter lists containing nested parentheses, e.g., default values like
//!   `array()`, will not match the signature.
//! - Brace characters inside string literals or comments are counted like any
//!   other brace. An unbalanced one will make the body end too early, too late,
//!   or never. Files that trip over this must be handled by protecting the
//!   whole file through the worktree ledger instead.

use regex::Regex;
use std::ops::Range;

/// Byte offsets of a located function body.
///
/// Both offsets point at the brace characters themselves, so the body is
/// everything strictly between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSpan {
    /// Offset of opening brace.
    pub open: usize,

    /// Offset of matching closing brace.
    pub close: usize,
}

impl FunctionSpan {
    /// Byte range of body, excluding braces.
    pub fn body(&self) -> Range<usize> {
        self.open + 1..self.close
    }
}

/// Locate body of named function.
///
/// # Errors
///
/// - Return [`ExtractError::NotFound`] if no signature matches.
/// - Return [`ExtractError::UnmatchedBraces`] if end of text is hit before
///   brace depth returns to zero.
pub fn locate(source: &str, function: &str) -> Result<FunctionSpan> {
    let signature = signature(function)?;
    let found = signature
        .find(source)
        .ok_or_else(|| ExtractError::NotFound {
            function: function.into(),
        })?;

    // INVARIANT: Signature pattern always ends on the opening brace.
    let open = found.end() - 1;
    let mut depth = 0usize;
    for (offset, byte) in source.as_bytes()[open..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(FunctionSpan {
                        open,
                        close: open + offset,
                    });
                }
            }
            _ => continue,
        }
    }

    Err(ExtractError::UnmatchedBraces {
        function: function.into(),
    })
}

/// Extract body of named function.
///
/// Returns the text strictly between the opening brace and its matching
/// closing brace.
///
/// # Errors
///
/// - Return [`ExtractError::NotFound`] if no signature matches.
/// - Return [`ExtractError::UnmatchedBraces`] if braces never balance.
pub fn extract<'src>(source: &'src str, function: &str) -> Result<&'src str> {
    let span = locate(source, function)?;
    Ok(&source[span.body()])
}

/// Replace body of named function.
///
/// Everything strictly between the braces is replaced with `body`. The braces
/// themselves, and everything around them, are kept verbatim.
///
/// # Errors
///
/// - Return [`ExtractError::NotFound`] if no signature matches.
/// - Return [`ExtractError::UnmatchedBraces`] if braces never balance.
pub fn reinsert(source: &str, function: &str, body: &str) -> Result<String> {
    let span = locate(source, function)?;
    let mut out = String::with_capacity(source.len() - span.body().len() + body.len());
    out.push_str(&source[..=span.open]);
    out.push_str(body);
    out.push_str(&source[span.close..]);

    Ok(out)
}

fn signature(function: &str) -> Result<Regex> {
    let pattern = format!(
        r"\b(?:public|protected|private)\s+(?:static\s+)?function\s+{}\s*\([^)]*\)\s*(?::\s*\??[\w\\|]+\s*)?\{{",
        regex::escape(function)
    );

    Regex::new(&pattern).map_err(|err| ExtractError::Pattern {
        source: err,
        function: function.into(),
    })
}

/// Function body extraction error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    /// No signature for function could be found.
    #[error("function {function:?} not found")]
    NotFound { function: String },

    /// Braces of function body never balance out.
    #[error("unmatched braces in body of function {function:?}")]
    UnmatchedBraces { function: String },

    /// Signature pattern could not be built for function name.
    #[error("invalid signature pattern for function {function:?}")]
    Pattern {
        #[source]
        source: regex::Error,
        function: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ExtractError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    const CONTROLLER: &str = indoc! {r#"
        <?php

        namespace App\Http\Controllers;

        class BackofficeLoginController extends Controller
        {
            public function check(Request $request)
            {
                if ($request->has('token')) {
                    return true;
                }
                return false;
            }

            private static function helper(): ?string
            {
                return null;
            }
        }
    "#};

    #[test]
    fn extract_spans_nested_blocks() -> anyhow::Result<()> {
        let body = extract(CONTROLLER, "check")?;
        let expect = "\n        if ($request->has('token')) {\n            return true;\n        }\n        return false;\n    ";
        assert_eq!(body, expect);

        Ok(())
    }

    #[test]
    fn extract_static_with_return_type() -> anyhow::Result<()> {
        let body = extract(CONTROLLER, "helper")?;
        assert_eq!(body.trim(), "return null;");

        Ok(())
    }

    #[test]
    fn extract_then_reinsert_is_identity() -> anyhow::Result<()> {
        for name in ["check", "helper"] {
            let body = extract(CONTROLLER, name)?;
            assert_eq!(reinsert(CONTROLLER, name, body)?, CONTROLLER);
        }

        Ok(())
    }

    #[test]
    fn reinsert_keeps_surrounding_text() -> anyhow::Result<()> {
        let source = "class A { public function check() { return false; } }\n";
        let result = reinsert(source, "check", " return true; ")?;
        assert_eq!(result, "class A { public function check() { return true; } }\n");

        Ok(())
    }

    #[test_case("class A { public function checkAll() { } }", "check"; "prefix of longer name")]
    #[test_case("class A { function check() { } }", "check"; "no access modifier")]
    #[test_case("class A { public function check($a = array()) { } }", "check"; "nested parentheses")]
    #[test]
    fn locate_not_found(source: &str, name: &str) {
        assert!(matches!(
            locate(source, name),
            Err(ExtractError::NotFound { .. })
        ));
    }

    #[test]
    fn locate_unmatched_braces() {
        let source = "class A { public function check() { if (x) { return 1; }";
        assert!(matches!(
            locate(source, "check"),
            Err(ExtractError::UnmatchedBraces { .. })
        ));
    }

    #[test]
    fn locate_escapes_function_name() {
        assert!(matches!(
            locate("public function axb() {}", "a.b"),
            Err(ExtractError::NotFound { .. })
        ));
    }
}

//! Parse errors and their deferred resolution to source loci.

use std::fmt;
use thiserror::Error;

/// A line/column position in a text file, 1-based.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TextFileLocus {
    /// The 1-based line number.
    pub line: u32,
    /// The 1-based byte column.
    pub column: u32,
}

impl fmt::Display for TextFileLocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Resolve a byte offset to a locus using the lexer's line-start table.
pub(crate) fn calc_locus_from_offset(line_info: &[u32], offset: u32) -> TextFileLocus {
    let line_index = match line_info.binary_search(&offset) {
        Ok(index) => index,
        Err(insertion) => insertion.saturating_sub(1),
    };
    TextFileLocus {
        line: line_index as u32 + 1,
        column: offset - line_info[line_index] + 1,
    }
}

/// A parse error recorded at a byte offset; offsets resolve to loci only
/// after parsing completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedError {
    /// The byte offset the error points at.
    pub offset: u32,
    /// The error message.
    pub message: String,
}

/// A parse error with its resolved source locus.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{locus}: {message}")]
pub struct Error {
    /// Where the error occurred.
    pub locus: TextFileLocus,
    /// The error message.
    pub message: String,
}

/// How a parse function unwinds.
///
/// `Recover` surfaces a recoverable error: the caller skips to the next
/// synchronization point (the next top-level `(`). `Fatal` represents an
/// unrecoverable scanner state and terminates script parsing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseAbort {
    /// Skip to the next top-level command.
    #[error("recoverable parse error")]
    Recover,
    /// Stop parsing.
    #[error("fatal parse error")]
    Fatal,
}

/// The result type of parse functions.
pub(crate) type ParseResult<T> = Result<T, ParseAbort>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locus_resolution() {
        // Lines starting at offsets 0, 10, 25.
        let line_info = [0u32, 10, 25];
        assert_eq!(
            calc_locus_from_offset(&line_info, 0),
            TextFileLocus { line: 1, column: 1 }
        );
        assert_eq!(
            calc_locus_from_offset(&line_info, 9),
            TextFileLocus { line: 1, column: 10 }
        );
        assert_eq!(
            calc_locus_from_offset(&line_info, 10),
            TextFileLocus { line: 2, column: 1 }
        );
        assert_eq!(
            calc_locus_from_offset(&line_info, 30),
            TextFileLocus { line: 3, column: 6 }
        );
    }
}

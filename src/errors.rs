use std::num::ParseIntError;

use thiserror::Error;

use crate::chess::piece::Colour;
use crate::chess::types::Rank;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenParseError {
    #[error("FEN string is missing board part")]
    MissingBoard,
    #[error("board part of FEN has {0} segments, expected 8")]
    BoardSegments(usize),
    #[error("wrong number of squares in board segment")]
    BadSquaresInSegment,
    #[error("adjacent digits in board segment are not allowed")]
    AdjacentDigits,
    #[error("unexpected character in piece placement: '{0}'")]
    UnexpectedCharacter(char),
    #[error("expected side to be 'w' or 'b', got \"{0}\"")]
    InvalidSide(String),
    #[error("expected side part")]
    MissingSide,
    #[error("expected castling part")]
    MissingCastling,
    #[error("invalid castling format: \"{0}\"")]
    InvalidCastling(String),
    #[error("{} king is missing", if *colour == Colour::White { "white" } else { "black" })]
    MissingKing { colour: Colour },
    #[error("more than one {} king", if *colour == Colour::White { "white" } else { "black" })]
    DuplicateKings { colour: Colour },
    #[error("invalid en passant square: \"{0}\"")]
    InvalidEnPassant(String),
    #[error("invalid en passant rank for square \"{square}\": expected {expected:?}, got {got:?}")]
    InvalidEnPassantRank {
        square: String,
        expected: Rank,
        got: Rank,
    },
    #[error("invalid halfmove clock: \"{0}\"")]
    InvalidHalfmoveClock(String),
    #[error("invalid fullmove number: \"{0}\"")]
    InvalidFullmoveNumber(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveParseError {
    #[error("invalid move length {0}")]
    InvalidLength(usize),
    #[error("invalid from-square file {0}")]
    InvalidFromSquareFile(char),
    #[error("invalid from-square rank {0}")]
    InvalidFromSquareRank(char),
    #[error("invalid to-square file {0}")]
    InvalidToSquareFile(char),
    #[error("invalid to-square rank {0}")]
    InvalidToSquareRank(char),
    #[error("invalid promotion piece {0}")]
    InvalidPromotionPiece(char),
    #[error("illegal move {0}")]
    IllegalMove(String),
}

/// Errors that can occur when parsing the `position` command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionParseError {
    #[error("failed to parse FEN: {0}")]
    Fen(#[from] FenParseError),
    #[error("failed to parse move: {0}")]
    Move(#[from] MoveParseError),
    #[error("`position` command requires a position specifier (fen or startpos)")]
    MissingPositionSpecifier,
    #[error("`position startpos` must be followed by `moves` or nothing, got \"{0}\"")]
    InvalidStartposSuffix(String),
    #[error("unknown position specifier \"{0}\", expected fen or startpos")]
    UnknownPositionSpecifier(String),
}

/// Errors that can occur when parsing the `go` command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoParseError {
    #[error("unknown go subcommand \"{0}\"")]
    UnknownSubcommand(String),
    #[error("missing value after `{0}`")]
    MissingValue(&'static str),
    #[error("failed to parse value for `{param}`: {source}")]
    InvalidValue {
        param: &'static str,
        source: ParseIntError,
    },
}

/// Errors that can occur when parsing the `setoption` command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetOptionParseError {
    #[error("`setoption` must be followed by `name`")]
    MissingNameKeyword,
    #[error("missing option name after `setoption name`")]
    MissingOptionName,
    #[error("missing value after `setoption name {0} value`")]
    MissingOptionValue(String),
    #[error("invalid value \"{value}\" for option `{name}`")]
    InvalidValue { name: String, value: String },
    #[error("value {got} out of range for option `{name}`, expected {lo}..={hi}")]
    ValueOutOfRange {
        name: String,
        lo: i64,
        hi: i64,
        got: i64,
    },
    #[error("unknown option `{0}`")]
    UnknownOption(String),
}

/// Top-level UCI errors.
#[derive(Debug, Error)]
pub enum UciError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Position(#[from] PositionParseError),
    #[error("{0}")]
    Go(#[from] GoParseError),
    #[error("{0}")]
    SetOption(#[from] SetOptionParseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

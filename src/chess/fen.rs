use crate::chess::{
    piece::{Colour, Piece, PieceType},
    piecelayout::PieceLayout,
    types::{CastlingRights, File, Rank, Square},
};
use crate::errors::FenParseError;

/// A parsed FEN record. Parsing builds this intermediate so that a
/// malformed string never leaves a half-mutated board behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fen {
    pub board: PieceLayout,
    pub turn: Colour,
    pub castling: CastlingRights,
    pub ep: Option<Square>,
    pub halfmove: u8,
    pub fullmove: usize,
}

impl Fen {
    /// Parses a six-field FEN. Castling accepts `KQkq`, Shredder letters
    /// (`A`-`H` / `a`-`h`), or `-`. The halfmove clock saturates into a
    /// byte and fullmove 0 is tolerated as fullmove 1.
    pub fn parse(text: &str) -> Result<Self, FenParseError> {
        let mut parts = text.split_ascii_whitespace();

        let board_part = parts.next().ok_or(FenParseError::MissingBoard)?;
        let board = parse_board(board_part)?;

        let side_part = parts.next().ok_or(FenParseError::MissingSide)?;
        let turn = match side_part {
            "w" => Colour::White,
            "b" => Colour::Black,
            other => return Err(FenParseError::InvalidSide(other.to_string())),
        };

        let castling_part = parts.next().ok_or(FenParseError::MissingCastling)?;
        let castling = parse_castling(castling_part, &board)?;

        let ep = match parts.next() {
            None | Some("-") => None,
            Some(ep_part) => {
                let sq: Square = ep_part
                    .parse()
                    .map_err(|_| FenParseError::InvalidEnPassant(ep_part.to_string()))?;
                let expected = Rank::Six.relative_to(turn);
                if sq.rank() != expected {
                    return Err(FenParseError::InvalidEnPassantRank {
                        square: ep_part.to_string(),
                        expected,
                        got: sq.rank(),
                    });
                }
                Some(sq)
            }
        };

        let halfmove = match parts.next() {
            None => 0,
            Some(part) => part
                .parse::<i64>()
                .map_err(|_| FenParseError::InvalidHalfmoveClock(part.to_string()))?
                .clamp(0, 255) as u8,
        };

        let fullmove = match parts.next() {
            None => 1,
            Some(part) => part
                .parse::<i64>()
                .map_err(|_| FenParseError::InvalidFullmoveNumber(part.to_string()))?
                .max(1) as usize,
        };

        Ok(Self {
            board,
            turn,
            castling,
            ep,
            halfmove,
            fullmove,
        })
    }
}

fn parse_board(board_part: &str) -> Result<PieceLayout, FenParseError> {
    let segments: Vec<&str> = board_part.split('/').collect();
    if segments.len() != 8 {
        return Err(FenParseError::BoardSegments(segments.len()));
    }

    let mut board = PieceLayout::default();
    for (seg_idx, segment) in segments.iter().enumerate() {
        let rank = Rank::from_index(7 - seg_idx as u8).unwrap();
        let mut file = 0u8;
        let mut last_was_digit = false;
        for c in segment.chars() {
            if let Some(skip) = c.to_digit(10) {
                if last_was_digit {
                    return Err(FenParseError::AdjacentDigits);
                }
                last_was_digit = true;
                file += skip as u8;
            } else {
                last_was_digit = false;
                let piece =
                    Piece::from_char(c).ok_or(FenParseError::UnexpectedCharacter(c))?;
                let f = File::from_index(file).ok_or(FenParseError::BadSquaresInSegment)?;
                board.set_piece_at(Square::from_rank_file(rank, f), piece);
                file += 1;
            }
        }
        if file != 8 {
            return Err(FenParseError::BadSquaresInSegment);
        }
    }

    for colour in Colour::all() {
        let kings = board.pieces[PieceType::King] & board.colours[colour];
        if kings == crate::chess::squareset::SquareSet::EMPTY {
            return Err(FenParseError::MissingKing { colour });
        }
        if kings.many() {
            return Err(FenParseError::DuplicateKings { colour });
        }
    }

    Ok(board)
}

fn parse_castling(
    castling_part: &str,
    board: &PieceLayout,
) -> Result<CastlingRights, FenParseError> {
    let mut rights = CastlingRights::default();
    if castling_part == "-" {
        return Ok(rights);
    }

    let err = || FenParseError::InvalidCastling(castling_part.to_string());

    for c in castling_part.chars() {
        let colour = if c.is_ascii_uppercase() {
            Colour::White
        } else {
            Colour::Black
        };
        let home_rank = Rank::One.relative_to(colour);
        let king_sq = board.king_sq(colour);
        if king_sq.rank() != home_rank {
            return Err(err());
        }
        let rooks = board.pieces[PieceType::Rook] & board.colours[colour]
            & crate::chess::squareset::SquareSet::RANKS[home_rank as usize];

        match c.to_ascii_uppercase() {
            // X-FEN: the relevant rook is the outermost one on that wing.
            'K' => {
                let rook = rooks
                    .iter()
                    .filter(|&sq| sq > king_sq)
                    .last()
                    .ok_or_else(err)?;
                rights.set_kingside(colour, rook.file());
            }
            'Q' => {
                let rook = rooks.iter().find(|&sq| sq < king_sq).ok_or_else(err)?;
                rights.set_queenside(colour, rook.file());
            }
            // Shredder: the letter names the rook's file directly.
            'A'..='H' => {
                let file = File::from_index(c.to_ascii_uppercase() as u8 - b'A').unwrap();
                let sq = Square::from_rank_file(home_rank, file);
                if !rooks.contains_square(sq) {
                    return Err(err());
                }
                if sq > king_sq {
                    rights.set_kingside(colour, file);
                } else {
                    rights.set_queenside(colour, file);
                }
            }
            _ => return Err(err()),
        }
    }

    Ok(rights)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[test]
    fn parses_the_starting_position() {
        let fen = Fen::parse(STARTPOS).unwrap();
        assert_eq!(fen.turn, Colour::White);
        assert_eq!(fen.castling.kingside(Colour::White), Some(File::H));
        assert_eq!(fen.castling.queenside(Colour::Black), Some(File::A));
        assert_eq!(fen.ep, None);
        assert_eq!(fen.halfmove, 0);
        assert_eq!(fen.fullmove, 1);
        assert_eq!(fen.board.occupied().count(), 32);
    }

    #[test]
    fn parses_shredder_castling() {
        let fen = Fen::parse("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w HAha - 0 1").unwrap();
        assert_eq!(fen.castling.kingside(Colour::White), Some(File::H));
        assert_eq!(fen.castling.queenside(Colour::White), Some(File::A));
        assert_eq!(fen.castling.kingside(Colour::Black), Some(File::H));
        assert_eq!(fen.castling.queenside(Colour::Black), Some(File::A));
    }

    #[test]
    fn fullmove_zero_is_tolerated() {
        let fen = Fen::parse("8/8/5k2/8/8/2K5/8/8 b - - 0 0").unwrap();
        assert_eq!(fen.fullmove, 1);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Fen::parse("").is_err());
        assert!(Fen::parse("8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Fen::parse("9/8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Fen::parse("8/8/8/8/8/8/8/8 w - - 0 1").is_err()); // no kings
        assert!(Fen::parse("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR x KQkq - 0 1").is_err());
        assert!(Fen::parse("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq e9 0 1").is_err());
    }
}

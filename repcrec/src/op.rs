use std::str::FromStr;

use crate::result::ParseOpError;
use crate::{SiteId, TxId, VarId, N_SITES, N_VARS};

/// One already-parsed input operation.
///
/// The engine consumes these records serially, one per tick. The textual
/// grammar is one operation per line, whitespace tolerated inside the
/// parentheses:
///
/// | Form            | Meaning                                    |
/// |-----------------|--------------------------------------------|
/// | `begin(Tn)`     | start read/write transaction `n`           |
/// | `beginRO(Tn)`   | start read-only transaction `n`            |
/// | `R(Tn, xk)`     | read variable `k` in transaction `n`       |
/// | `W(Tn, xk, v)`  | write value `v` to variable `k` in `n`     |
/// | `end(Tn)`       | attempt to commit transaction `n`          |
/// | `fail(s)`       | site `s` fails                             |
/// | `recover(s)`    | site `s` recovers                          |
/// | `dump()`        | emit committed values of all variables     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Begin(TxId),
    BeginRo(TxId),
    Read(TxId, VarId),
    Write(TxId, VarId, i64),
    End(TxId),
    Fail(SiteId),
    Recover(SiteId),
    Dump,
}

impl Op {
    /// The transaction this operation belongs to, if any.
    ///
    /// Site and dump operations have no owner; they always complete and are
    /// never parked in the retry queue.
    pub fn owner(&self) -> Option<TxId> {
        match *self {
            Op::Begin(tx) | Op::BeginRo(tx) | Op::Read(tx, _) | Op::Write(tx, _, _) | Op::End(tx) => {
                Some(tx)
            }
            Op::Fail(_) | Op::Recover(_) | Op::Dump => None,
        }
    }
}

fn parse_tx(arg: &str) -> Result<TxId, ParseOpError> {
    let err = || ParseOpError::TransactionId(arg.to_string());
    let index: TxId = arg.strip_prefix('T').ok_or_else(err)?.parse().map_err(|_| err())?;
    if index == 0 {
        return Err(err());
    }
    Ok(index)
}

fn parse_var(arg: &str) -> Result<VarId, ParseOpError> {
    let err = || ParseOpError::VariableId(arg.to_string());
    let index: VarId = arg.strip_prefix('x').ok_or_else(err)?.parse().map_err(|_| err())?;
    if !(1..=N_VARS).contains(&index) {
        return Err(err());
    }
    Ok(index)
}

fn parse_site(arg: &str) -> Result<SiteId, ParseOpError> {
    let err = || ParseOpError::SiteId(arg.to_string());
    let index: SiteId = arg.parse().map_err(|_| err())?;
    if !(1..=N_SITES).contains(&index) {
        return Err(err());
    }
    Ok(index)
}

fn parse_value(arg: &str) -> Result<i64, ParseOpError> {
    arg.parse().map_err(|_| ParseOpError::Value(arg.to_string()))
}

impl FromStr for Op {
    type Err = ParseOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let malformed = || ParseOpError::Malformed(line.to_string());

        let open = line.find('(').ok_or_else(malformed)?;
        let close = line.rfind(')').filter(|&c| c > open).ok_or_else(malformed)?;
        let verb = line[..open].trim();
        let inner = line[open + 1..close].trim();
        let args: Vec<&str> = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(str::trim).collect()
        };

        let arity = |expected: usize| -> Result<(), ParseOpError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ParseOpError::Arity { op: line.to_string(), expected })
            }
        };

        match verb {
            "begin" => {
                arity(1)?;
                Ok(Op::Begin(parse_tx(args[0])?))
            }
            "beginRO" => {
                arity(1)?;
                Ok(Op::BeginRo(parse_tx(args[0])?))
            }
            "R" => {
                arity(2)?;
                Ok(Op::Read(parse_tx(args[0])?, parse_var(args[1])?))
            }
            "W" => {
                arity(3)?;
                Ok(Op::Write(parse_tx(args[0])?, parse_var(args[1])?, parse_value(args[2])?))
            }
            "end" => {
                arity(1)?;
                Ok(Op::End(parse_tx(args[0])?))
            }
            "fail" => {
                arity(1)?;
                Ok(Op::Fail(parse_site(args[0])?))
            }
            "recover" => {
                arity(1)?;
                Ok(Op::Recover(parse_site(args[0])?))
            }
            "dump" => {
                arity(0)?;
                Ok(Op::Dump)
            }
            _ => Err(ParseOpError::UnknownOp(line.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_simple() {
        assert_eq!("begin(T1)".parse(), Ok(Op::Begin(1)));
        assert_eq!("beginRO(T3)".parse(), Ok(Op::BeginRo(3)));
        assert_eq!("R(T2,x4)".parse(), Ok(Op::Read(2, 4)));
        assert_eq!("W(T1,x6,99)".parse(), Ok(Op::Write(1, 6, 99)));
        assert_eq!("end(T1)".parse(), Ok(Op::End(1)));
        assert_eq!("fail(2)".parse(), Ok(Op::Fail(2)));
        assert_eq!("recover(10)".parse(), Ok(Op::Recover(10)));
        assert_eq!("dump()".parse(), Ok(Op::Dump));
    }

    #[test]
    fn parse_tolerates_whitespace() {
        assert_eq!("  W( T1 , x6 , -4 )  ".parse(), Ok(Op::Write(1, 6, -4)));
        assert_eq!("R(T11, x20)".parse(), Ok(Op::Read(11, 20)));
    }

    #[test]
    fn parse_rejects_unknown_verbs() {
        assert!(matches!("frob(T1)".parse::<Op>(), Err(ParseOpError::UnknownOp(_))));
        assert!(matches!("begin T1".parse::<Op>(), Err(ParseOpError::Malformed(_))));
    }

    #[test]
    fn parse_rejects_bad_ids() {
        assert!(matches!("begin(T0)".parse::<Op>(), Err(ParseOpError::TransactionId(_))));
        assert!(matches!("R(T1,x21)".parse::<Op>(), Err(ParseOpError::VariableId(_))));
        assert!(matches!("R(T1,4)".parse::<Op>(), Err(ParseOpError::VariableId(_))));
        assert!(matches!("fail(11)".parse::<Op>(), Err(ParseOpError::SiteId(_))));
        assert!(matches!("W(T1,x2,ten)".parse::<Op>(), Err(ParseOpError::Value(_))));
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        assert!(matches!("R(T1)".parse::<Op>(), Err(ParseOpError::Arity { expected: 2, .. })));
        assert!(matches!("dump(1)".parse::<Op>(), Err(ParseOpError::Arity { expected: 0, .. })));
    }

    #[test]
    fn owner_of_site_ops_is_none() {
        assert_eq!(Op::Fail(1).owner(), None);
        assert_eq!(Op::Dump.owner(), None);
        assert_eq!(Op::Write(7, 2, 0).owner(), Some(7));
    }
}

//! Counter expressions, which compute region counts from the physical counters of a function.

use std::fmt;

use indexmap::IndexSet;
use serde::Serialize;

use instrprof_common::{Error, ErrorKind};

/// The deepest nesting of expressions that is decoded or evaluated.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

/// The largest number of expression nodes decoded for all regions of one function record.
///
/// Expression tables may share subexpressions, so a short table can describe an exponentially
/// large tree.
pub const MAX_EXPRESSION_NODES: usize = 1 << 16;

/// Decoded expression nodes allowed per byte of encoded function record data.
pub(crate) const EXPRESSION_NODES_PER_BYTE: usize = 16;

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const TAG_ZERO: u64 = 0;
const TAG_COUNTER: u64 = 1;
const TAG_SUBTRACT: u64 = 2;
const TAG_ADD: u64 = 3;

fn corrupt(detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::CorruptMapping).with_detail(detail.into())
}

/// The count of a region, expressed in terms of the counters of its function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CounterExpression {
    /// A region that is never counted.
    Zero,
    /// The counter at the given index.
    Counter(u32),
    /// The saturating sum of both operands.
    Add(Box<CounterExpression>, Box<CounterExpression>),
    /// The left operand minus the right one, clamped at zero.
    Subtract(Box<CounterExpression>, Box<CounterExpression>),
}

impl CounterExpression {
    /// Creates the sum of two expressions.
    pub fn add(lhs: CounterExpression, rhs: CounterExpression) -> Self {
        Self::Add(Box::new(lhs), Box::new(rhs))
    }

    /// Creates the difference of two expressions.
    pub fn subtract(lhs: CounterExpression, rhs: CounterExpression) -> Self {
        Self::Subtract(Box::new(lhs), Box::new(rhs))
    }

    /// Computes the count of this expression from the counters of a profile record.
    ///
    /// A reference to a counter the record does not have fails with
    /// [`ErrorKind::CorruptMapping`], as does nesting deeper than [`MAX_EXPRESSION_DEPTH`].
    ///
    /// # Examples
    ///
    /// ```
    /// use instrprof_covmap::CounterExpression;
    ///
    /// let expr = CounterExpression::subtract(
    ///     CounterExpression::Counter(0),
    ///     CounterExpression::Counter(1),
    /// );
    /// assert_eq!(expr.evaluate(&[10, 3]).unwrap(), 7);
    /// ```
    pub fn evaluate(&self, counters: &[u64]) -> Result<u64, Error> {
        self.evaluate_at(counters, 0)
    }

    fn evaluate_at(&self, counters: &[u64], depth: usize) -> Result<u64, Error> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(corrupt("counter expression is nested too deeply"));
        }

        match self {
            Self::Zero => Ok(0),
            Self::Counter(index) => counters.get(*index as usize).copied().ok_or_else(|| {
                corrupt(format!(
                    "counter {index} is out of range, the record has {} counters",
                    counters.len()
                ))
            }),
            Self::Add(lhs, rhs) => {
                let lhs = lhs.evaluate_at(counters, depth + 1)?;
                let rhs = rhs.evaluate_at(counters, depth + 1)?;
                Ok(lhs.saturating_add(rhs))
            }
            Self::Subtract(lhs, rhs) => {
                let lhs = lhs.evaluate_at(counters, depth + 1)?;
                let rhs = rhs.evaluate_at(counters, depth + 1)?;
                Ok(lhs.saturating_sub(rhs))
            }
        }
    }

    /// The highest counter index referenced anywhere in the expression.
    pub fn max_counter(&self) -> Option<u32> {
        match self {
            Self::Zero => None,
            Self::Counter(index) => Some(*index),
            Self::Add(lhs, rhs) | Self::Subtract(lhs, rhs) => {
                lhs.max_counter().max(rhs.max_counter())
            }
        }
    }
}

impl fmt::Display for CounterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "0"),
            Self::Counter(index) => write!(f, "#{index}"),
            Self::Add(lhs, rhs) => write!(f, "({lhs} + {rhs})"),
            Self::Subtract(lhs, rhs) => write!(f, "({lhs} - {rhs})"),
        }
    }
}

/// The expression table of a function record, as encoded operand pairs.
///
/// Whether an entry is a sum or a difference is decided by the tag of the reference to it.
pub(crate) struct ExpressionTable {
    entries: Vec<(u64, u64)>,
    budget: usize,
}

impl ExpressionTable {
    /// Creates a table that decodes at most `budget` nodes over all calls to `resolve`.
    pub fn new(entries: Vec<(u64, u64)>, budget: usize) -> Self {
        Self { entries, budget }
    }

    /// Decodes an encoded counter reference into an expression tree.
    pub fn resolve(&mut self, encoded: u64) -> Result<CounterExpression, Error> {
        let mut budget = self.budget;
        let expression = self.resolve_at(encoded, 0, &mut budget)?;
        self.budget = budget;
        Ok(expression)
    }

    fn resolve_at(
        &self,
        encoded: u64,
        depth: usize,
        budget: &mut usize,
    ) -> Result<CounterExpression, Error> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(corrupt("counter expression is nested too deeply"));
        }
        *budget = budget
            .checked_sub(1)
            .ok_or_else(|| corrupt("counter expression is too large"))?;

        let index = encoded >> TAG_BITS;
        match encoded & TAG_MASK {
            TAG_ZERO => Ok(CounterExpression::Zero),
            TAG_COUNTER => u32::try_from(index)
                .map(CounterExpression::Counter)
                .map_err(|_| corrupt(format!("counter index {index} is out of range"))),
            tag => {
                let &(lhs, rhs) = usize::try_from(index)
                    .ok()
                    .and_then(|index| self.entries.get(index))
                    .ok_or_else(|| {
                        corrupt(format!(
                            "expression {index} is out of range, the record has {} expressions",
                            self.entries.len()
                        ))
                    })?;
                let lhs = Box::new(self.resolve_at(lhs, depth + 1, budget)?);
                let rhs = Box::new(self.resolve_at(rhs, depth + 1, budget)?);
                Ok(if tag == TAG_ADD {
                    CounterExpression::Add(lhs, rhs)
                } else {
                    CounterExpression::Subtract(lhs, rhs)
                })
            }
        }
    }
}

/// Builds the expression table of a function record while encoding references to it.
#[derive(Default)]
pub(crate) struct ExpressionEncoder {
    entries: IndexSet<(u64, u64)>,
}

impl ExpressionEncoder {
    /// Encodes a reference to the expression, adding its operands to the table.
    pub fn encode(&mut self, expression: &CounterExpression) -> u64 {
        let (tag, lhs, rhs) = match expression {
            CounterExpression::Zero => return TAG_ZERO,
            CounterExpression::Counter(index) => {
                return (u64::from(*index) << TAG_BITS) | TAG_COUNTER
            }
            CounterExpression::Add(lhs, rhs) => (TAG_ADD, lhs, rhs),
            CounterExpression::Subtract(lhs, rhs) => (TAG_SUBTRACT, lhs, rhs),
        };

        let operands = (self.encode(lhs), self.encode(rhs));
        let (index, _) = self.entries.insert_full(operands);
        ((index as u64) << TAG_BITS) | tag
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &(u64, u64)> + '_ {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use CounterExpression::{Counter, Zero};

    #[test]
    fn test_evaluate() {
        let counters = [10, 3];
        assert_eq!(
            CounterExpression::subtract(Counter(0), Counter(1))
                .evaluate(&counters)
                .unwrap(),
            7
        );
        assert_eq!(
            CounterExpression::add(Counter(0), Counter(1))
                .evaluate(&counters)
                .unwrap(),
            13
        );
        assert_eq!(Zero.evaluate(&[]).unwrap(), 0);
    }

    #[test]
    fn test_evaluate_saturates() {
        let counters = [u64::MAX, 3];
        let sum = CounterExpression::add(Counter(0), Counter(1));
        assert_eq!(sum.evaluate(&counters).unwrap(), u64::MAX);

        let difference = CounterExpression::subtract(Counter(1), Counter(0));
        assert_eq!(difference.evaluate(&counters).unwrap(), 0);
    }

    #[test]
    fn test_evaluate_out_of_range() {
        let err = Counter(2).evaluate(&[1, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_evaluate_too_deep() {
        let mut expr = Counter(0);
        for _ in 0..=MAX_EXPRESSION_DEPTH {
            expr = CounterExpression::add(expr, Zero);
        }
        let err = expr.evaluate(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_display() {
        let expr = CounterExpression::subtract(
            CounterExpression::add(Counter(0), Counter(2)),
            Zero,
        );
        assert_eq!(expr.to_string(), "((#0 + #2) - 0)");
        assert_eq!(expr.max_counter(), Some(2));
    }

    #[test]
    fn test_encode_and_resolve() {
        let expr = CounterExpression::subtract(
            CounterExpression::add(Counter(0), Counter(1)),
            CounterExpression::add(Counter(0), Counter(1)),
        );

        let mut encoder = ExpressionEncoder::default();
        let encoded = encoder.encode(&expr);
        // the shared subexpression is stored once
        assert_eq!(encoder.entries().len(), 2);

        let mut table =
            ExpressionTable::new(encoder.entries().copied().collect(), MAX_EXPRESSION_NODES);
        assert_eq!(table.resolve(encoded).unwrap(), expr);
    }

    #[test]
    fn test_resolve_cycle() {
        // expression 0 adds itself
        let mut table = ExpressionTable::new(vec![(TAG_ADD, 1)], MAX_EXPRESSION_NODES);
        let err = table.resolve(TAG_ADD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_resolve_exponential() {
        // every entry references the previous one twice
        let mut entries = vec![(TAG_COUNTER, TAG_COUNTER)];
        for index in 0..40u64 {
            let previous = (index << TAG_BITS) | TAG_ADD;
            entries.push((previous, previous));
        }
        let mut table = ExpressionTable::new(entries, MAX_EXPRESSION_NODES);
        let err = table.resolve((40 << TAG_BITS) | TAG_ADD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let mut table = ExpressionTable::new(vec![], MAX_EXPRESSION_NODES);
        let err = table.resolve(TAG_SUBTRACT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_budget_shared_between_references() {
        // 2^10 - 1 nodes per reference
        let mut entries = vec![(TAG_COUNTER, TAG_COUNTER)];
        for index in 0..8u64 {
            let previous = (index << TAG_BITS) | TAG_ADD;
            entries.push((previous, previous));
        }
        let deepest = (8 << TAG_BITS) | TAG_ADD;

        let mut table = ExpressionTable::new(entries, 4000);
        for _ in 0..3 {
            table.resolve(deepest).unwrap();
        }
        let err = table.resolve(deepest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }
}

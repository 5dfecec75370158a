//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No single output or transaction total may exceed this many satoshi.
pub const MAX_MONEY: Amount = 21_000_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Adds two amounts, failing when the sum leaves the valid money range.
pub fn checked_money_add(left: Amount, right: Amount) -> Option<Amount> {
    let sum = left.checked_add(right)?;
    money_range(sum).then_some(sum)
}

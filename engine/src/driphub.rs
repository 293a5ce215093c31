//! Recurring-order settlement engine.
//!
//! Tracks many independent recurring-conversion positions ("deposit token A,
//! convert a fixed slice into token B every interval") over pooled liquidity,
//! and settles all of them for a (pair, interval) in one batched operation:
//!
//! 1. Aggregate-rate accounting: each (pair, interval, direction) keeps a live
//!    aggregate rate plus a sparse map of signed rate deltas keyed by swap
//!    number, so opening/closing a position is O(log n) and settlement never
//!    iterates positions.
//! 2. Cumulative ratio accounting: settlement appends one accumulator entry
//!    per executed swap per direction; a position's converted amount is
//!    `rate * (accum[s1] - accum[s0]) / magnitude(from)`, computable at any
//!    later time because accumulator history is append-only.
//! 3. Conservation: for every token, the book balance always covers the sum
//!    of unconverted principal, converted-but-unwithdrawn output, and the
//!    platform fee balance (`check_conservation`).
//!
//! The engine is pure state + arithmetic: the wrapper injects timestamps,
//! oracle ratios and caller identities, moves real tokens, and persists the
//! whole struct through borsh. Atomicity is the wrapper's transaction model:
//! if an operation returns Err, the surrounding transaction aborts and no
//! mutation is committed.

#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use borsh::{BorshDeserialize, BorshSerialize};

pub mod intervals;

// ============================================================================
// Constants
// ============================================================================

/// Fee ratios are expressed in units of 1/FEE_PRECISION of a percent:
/// a `swap_fee` of 6000 charges 6000 / 10_000 = 0.6%.
pub const FEE_PRECISION: u32 = 10_000;

/// Full divisor for fee math: `amount * fee / FEE_PRECISION / 100`.
pub const FEE_DIVISOR: u128 = FEE_PRECISION as u128 * 100;

/// Hard ceiling for swap and loan fees: 10%.
pub const MAX_FEE: u32 = 100_000;

/// `platform_fee_ratio` is a share of the collected fee, in 1/FEE_PRECISION.
pub const MAX_PLATFORM_FEE_RATIO: u16 = FEE_PRECISION as u16;

/// `max_imbalance_bps` is a fraction of total pair volume, in basis points.
pub const MAX_IMBALANCE_BPS: u16 = 10_000;

/// Ceiling on oracle ratios. With aggregate rates bounded by `MAX_BALANCE`,
/// this keeps every rate-times-ratio product inside u128.
pub const MAX_RATIO: u128 = u64::MAX as u128;

/// Ceiling on a token's book balance. Real custody is u64 (SPL amounts), so
/// aggregate rates and owed amounts inherit the bound.
pub const MAX_BALANCE: u128 = u64::MAX as u128;

// Position permission bits. The owner implicitly holds all of them; one
// operator per position can be granted a subset.
pub const PERM_WITHDRAW: u8 = 1 << 0;
pub const PERM_INCREASE: u8 = 1 << 1;
pub const PERM_REDUCE: u8 = 1 << 2;
pub const PERM_TERMINATE: u8 = 1 << 3;
pub const PERM_ALL: u8 = PERM_WITHDRAW | PERM_INCREASE | PERM_REDUCE | PERM_TERMINATE;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubError {
    /// Interval length is not one of the eight recognized cadences
    InvalidInterval,

    /// Byte is not exactly one valid single-bit interval mask
    InvalidMask,

    /// Interval is recognized but not currently allowed
    UnallowedInterval,

    /// Token is registered but not currently allowed
    UnallowedToken,

    /// Token was never registered
    UnknownToken,

    /// A pair's two tokens are identical
    SameToken,

    /// Amount must be nonzero
    ZeroAmount,

    /// Number of swaps must be nonzero
    ZeroSwaps,

    /// Deposit amount must be an exact multiple of the number of swaps
    AmountNotDivisible,

    /// Token list is unsorted, duplicated, or indexes it out of range
    InvalidTokens,

    /// Pair index list is unsorted, duplicated, or not canonical
    DuplicatePairs,

    /// Position id does not exist
    PositionNotFound,

    /// Caller lacks the required permission on the position
    Unauthorized,

    /// Operation is blocked while the hub is paused
    Paused,

    /// Position principal is smaller than the requested reduction
    InsufficientBalance,

    /// Loan request exceeds the hub's balance of the token
    InsufficientLiquidity,

    /// Platform balance is smaller than the requested withdrawal
    InsufficientPlatformBalance,

    /// Non-privileged settlement exceeds the configured imbalance bound
    UnbalancedSettlement,

    /// Fee or ratio parameter exceeds its ceiling
    FeeTooHigh,

    /// Arithmetic overflow (or internal ledger inconsistency)
    Overflow,
}

pub type Result<T> = core::result::Result<T, HubError>;

// ============================================================================
// Math Helpers
// ============================================================================

/// Overflow-safe `a * b / div`.
///
/// Multiplies first when the product fits (full precision), otherwise divides
/// first (loses at most `b` units of precision but never overflows for any
/// `a / div * b` that fits the width). Division by zero is an error, not a
/// panic.
#[inline]
pub fn mul_div(a: u128, b: u128, div: u128) -> Result<u128> {
    if div == 0 {
        return Err(HubError::Overflow);
    }
    match a.checked_mul(b) {
        Some(product) => Ok(product / div),
        None => (a / div).checked_mul(b).ok_or(HubError::Overflow),
    }
}

/// `a * b / div` rounded up. Used for settlement inflow requirements so the
/// hub is never short: a position's withdrawal divides once over many swaps
/// (`floor(sum)`), which can exceed a sum of per-swap floors but never a sum
/// of per-swap ceilings. Callers keep `a * b` within the width (rates are
/// u64-bounded and ratios are validated against `MAX_RATIO`).
#[inline]
pub fn mul_div_ceil(a: u128, b: u128, div: u128) -> Result<u128> {
    if div == 0 {
        return Err(HubError::Overflow);
    }
    let product = a.checked_mul(b).ok_or(HubError::Overflow)?;
    Ok(product / div + u128::from(product % div != 0))
}

/// Fee charged on `amount` at ratio `fee` (units of 1/FEE_PRECISION percent).
#[inline]
pub fn fee_for_amount(fee: u32, amount: u128) -> Result<u128> {
    mul_div(amount, fee as u128, FEE_DIVISOR)
}

/// `amount` minus the fee charged on it.
#[inline]
pub fn subtract_fee(fee: u32, amount: u128) -> Result<u128> {
    let charged = fee_for_amount(fee, amount)?;
    // charged <= amount / 10 for any fee within MAX_FEE
    amount.checked_sub(charged).ok_or(HubError::Overflow)
}

#[inline]
fn add_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(HubError::Overflow)
}

/// Book-balance credit, capped at `MAX_BALANCE` (the u64 custody bound that
/// keeps aggregate rates inside the settlement math's width).
#[inline]
fn credit_balance(balance: u128, amount: u128) -> Result<u128> {
    let new = add_u128(balance, amount)?;
    if new > MAX_BALANCE {
        return Err(HubError::Overflow);
    }
    Ok(new)
}

#[inline]
fn sub_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(HubError::Overflow)
}

#[inline]
fn to_u64(x: u128) -> Result<u64> {
    u64::try_from(x).map_err(|_| HubError::Overflow)
}

// ============================================================================
// Core Data Structures
// ============================================================================

/// Opaque token identity. The wrapper uses mint public keys; the engine only
/// compares bytes (pair canonicalization orders by byte value).
pub type TokenId = [u8; 32];

/// Registry entry for a token. Entries are never deleted: disallowing a token
/// flips `allowed` but keeps balances and positions readable, so funds in a
/// since-disallowed token are never trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TokenMeta {
    /// Whether new deposits and settlements may use this token
    pub allowed: bool,

    /// 10^decimals of the token; the fixed-point unit ratios are quoted per
    pub magnitude: u64,

    /// Opaque oracle feed id for this token (interpreted by the wrapper)
    pub price_feed: [u8; 32],

    /// Opaque custody account id the wrapper holds this token in
    pub vault: [u8; 32],

    /// Book balance: everything the hub holds of this token
    /// (principal + owed output + platform fees)
    pub balance: u128,

    /// Segregated protocol-fee balance, withdrawable only by the admin
    pub platform_balance: u128,
}

/// Canonical unordered token pair: `token_a < token_b` byte-wise, always.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize,
)]
pub struct PairKey {
    pub token_a: TokenId,
    pub token_b: TokenId,
}

impl PairKey {
    /// Build the canonical key for two distinct tokens, in either order.
    pub fn new(x: TokenId, y: TokenId) -> Result<Self> {
        match x.cmp(&y) {
            core::cmp::Ordering::Less => Ok(Self { token_a: x, token_b: y }),
            core::cmp::Ordering::Greater => Ok(Self { token_a: y, token_b: x }),
            core::cmp::Ordering::Equal => Err(HubError::SameToken),
        }
    }

    /// Direction index for a conversion out of `from`: 0 = A->B, 1 = B->A.
    #[inline]
    pub fn direction(&self, from: &TokenId) -> usize {
        if *from == self.token_a {
            0
        } else {
            1
        }
    }
}

/// One direction of one (pair, interval) ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DirectionState {
    /// Live aggregate rate: input tokens converted per swap, summed over all
    /// positions whose swaps have not yet run out
    pub rate: u128,

    /// Signed rate adjustments taking effect at a future swap number.
    /// A position with `n` swaps registered at performed-swap `p` stores
    /// `-rate` at key `p + n + 1`; settlement of swap `s` consumes key `s + 1`.
    pub delta: BTreeMap<u32, i128>,

    /// Cumulative fee-adjusted ratio as of the end of each executed swap
    /// number. Append-only: an entry is written exactly once, when its swap
    /// executes, and never rewritten, so positions may read historical values
    /// at any later time. Swap number 0 is implicitly 0.
    pub accum: BTreeMap<u32, u128>,
}

impl DirectionState {
    /// Cumulative ratio as of the end of `swap_number`.
    /// Every executed swap has an entry; a missing one is ledger corruption.
    fn accum_at(&self, swap_number: u32) -> Result<u128> {
        if swap_number == 0 {
            return Ok(0);
        }
        self.accum.get(&swap_number).copied().ok_or(HubError::Overflow)
    }
}

/// Ledger for one (pair, interval).
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct IntervalLedger {
    /// Count of settlement rounds executed for this (pair, interval)
    pub performed_swaps: u32,

    /// Earliest unix time the next round may execute; 0 = due immediately.
    /// Realigned to the interval grid after every round.
    pub next_swap_available_at: u64,

    /// token_a -> token_b direction
    pub a_to_b: DirectionState,

    /// token_b -> token_a direction
    pub b_to_a: DirectionState,
}

impl IntervalLedger {
    #[inline]
    fn side(&self, dir: usize) -> &DirectionState {
        if dir == 0 {
            &self.a_to_b
        } else {
            &self.b_to_a
        }
    }

    #[inline]
    fn side_mut(&mut self, dir: usize) -> &mut DirectionState {
        if dir == 0 {
            &mut self.a_to_b
        } else {
            &mut self.b_to_a
        }
    }

    /// A round is worth executing only while some position is live.
    #[inline]
    fn has_live_rate(&self) -> bool {
        self.a_to_b.rate != 0 || self.b_to_a.rate != 0
    }
}

/// Per-pair state: the packed set of intervals with live positions, plus one
/// ledger per interval ever used (ledgers are kept once created so that
/// accumulator history survives the last position leaving).
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PairState {
    /// One bit per cadence, set while at least one position is live
    pub active_intervals: u8,

    /// Interval mask -> ledger
    pub ledgers: BTreeMap<u8, IntervalLedger>,
}

/// A single recurring-conversion order.
///
/// Invariant: the position's expiry delta in the pair ledger is keyed at
/// `last_updated_swap + swaps_left + 1`, which withdrawals preserve (both
/// fields move together).
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Position {
    /// Token being sold
    pub from: TokenId,

    /// Token being bought
    pub to: TokenId,

    /// Single-bit cadence mask
    pub interval_mask: u8,

    /// Input tokens converted per swap
    pub rate: u64,

    /// Rounds remaining after `last_updated_swap`
    pub swaps_left: u32,

    /// Swap number as of which `rate`/`swaps_left` were last registered;
    /// converted output before this point has been withdrawn or flushed
    /// into `pre_accumulated_swapped`
    pub last_updated_swap: u32,

    /// Output already owed from before the last rate change, not yet withdrawn
    pub pre_accumulated_swapped: u128,

    /// Owner identity (signature checks are the wrapper's responsibility)
    pub owner: [u8; 32],

    /// Optional delegate; all-zero = none
    pub operator: [u8; 32],

    /// PERM_* bits granted to the operator
    pub operator_permissions: u8,
}

impl Position {
    /// Principal not yet flushed out of the window: `rate * swaps_left`.
    /// Only equal to the live unconverted principal right after a flush;
    /// `HubEngine::unconverted_principal` gives the always-current value.
    #[inline]
    pub fn remaining_principal(&self) -> u128 {
        self.rate as u128 * self.swaps_left as u128
    }

    /// Whether `caller` may perform the action guarded by `perm`.
    pub fn allows(&self, caller: &[u8; 32], perm: u8) -> bool {
        if *caller == self.owner {
            return true;
        }
        *caller == self.operator && self.operator_permissions & perm != 0
    }
}

/// Governance-controlled parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HubParams {
    /// Settlement fee, units of 1/FEE_PRECISION percent
    pub swap_fee: u32,

    /// Flash loan fee, same units
    pub loan_fee: u32,

    /// Share of each swap fee booked to the platform balance,
    /// in 1/FEE_PRECISION; the remainder is the settler's spread
    pub platform_fee_ratio: u16,

    /// Per-pair imbalance bound for non-privileged settlements, in bps
    pub max_imbalance_bps: u16,

    /// Packed set of cadences deposits may use
    pub allowed_intervals: u8,

    /// Blocks deposit / increase / settle / loan; never withdrawals
    pub paused: bool,
}

/// Main hub state.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HubEngine {
    /// Governance parameters
    pub params: HubParams,

    /// Token registry (entries are never deleted)
    pub tokens: BTreeMap<TokenId, TokenMeta>,

    /// Pair ledgers, keyed by canonical pair
    pub pairs: BTreeMap<PairKey, PairState>,

    /// Open positions by id
    pub positions: BTreeMap<u64, Position>,

    /// Next position id (monotonically increasing, never recycled)
    pub next_position_id: u64,
}

// ============================================================================
// Settlement Plan Types
// ============================================================================

/// Oracle quote for one pair: output units received per `magnitude(input)`
/// of input, for each direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairQuote {
    pub ratio_a_to_b: u128,
    pub ratio_b_to_a: u128,
}

/// Net per-token flow of a settlement basket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenFlow {
    pub token: TokenId,

    /// Amount the caller must source into the hub by the end of the callback
    pub to_provide: u64,

    /// Amount transferred out to the caller up front
    pub reward: u64,

    /// Portion of the collected fee booked to the platform balance
    pub platform_fee: u128,
}

/// One (pair, interval) round scheduled by a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntervalSettlement {
    pub interval_mask: u8,

    /// The round being executed: previous performed_swaps + 1
    pub swap_number: u32,

    /// Aggregate rate executed per direction [a_to_b, b_to_a]
    pub rate: [u128; 2],

    /// Fee-adjusted ratio appended to each direction's accumulator
    /// (0 for a direction with no live rate)
    pub ratio_with_fee: [u128; 2],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairSettlement {
    pub pair: PairKey,
    pub intervals: Vec<IntervalSettlement>,
}

/// Everything a settlement will do, computed without mutating. The wrapper
/// transfers rewards out, runs the flash callback, verifies repayment, and
/// only then commits the plan — nothing changes until every post-condition
/// holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementPlan {
    /// Per-token net flows, in the caller's token order
    pub flows: Vec<TokenFlow>,

    /// Rounds to execute
    pub pairs: Vec<PairSettlement>,
}

impl SettlementPlan {
    /// True when no (pair, interval) in the basket was due.
    pub fn is_empty(&self) -> bool {
        self.pairs.iter().all(|p| p.intervals.is_empty())
    }
}

/// Outcome of a terminated position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminateOutcome {
    pub from: TokenId,
    pub to: TokenId,

    /// Unconverted principal returned, in `from` units
    pub unswapped: u64,

    /// Converted output returned, in `to` units
    pub swapped: u64,
}

// ============================================================================
// Core Implementation
// ============================================================================

impl HubEngine {
    pub fn new(params: HubParams) -> Result<Self> {
        validate_fee(params.swap_fee)?;
        validate_fee(params.loan_fee)?;
        if params.platform_fee_ratio > MAX_PLATFORM_FEE_RATIO
            || params.max_imbalance_bps > MAX_IMBALANCE_BPS
        {
            return Err(HubError::FeeTooHigh);
        }
        Ok(Self {
            params,
            tokens: BTreeMap::new(),
            pairs: BTreeMap::new(),
            positions: BTreeMap::new(),
            next_position_id: 1,
        })
    }

    // ========================================
    // Configuration
    // ========================================

    /// Register a token, or re-allow a previously disallowed one. Magnitude
    /// is set on first registration; feed and custody ids are refreshed on
    /// re-allow.
    pub fn allow_token(
        &mut self,
        token: TokenId,
        magnitude: u64,
        price_feed: [u8; 32],
        vault: [u8; 32],
    ) -> Result<()> {
        if magnitude == 0 {
            return Err(HubError::ZeroAmount);
        }
        match self.tokens.get_mut(&token) {
            Some(meta) => {
                meta.allowed = true;
                meta.price_feed = price_feed;
                meta.vault = vault;
            }
            None => {
                self.tokens.insert(
                    token,
                    TokenMeta {
                        allowed: true,
                        magnitude,
                        price_feed,
                        vault,
                        balance: 0,
                        platform_balance: 0,
                    },
                );
            }
        }
        Ok(())
    }

    /// Block new deposits and settlements through a token. Existing positions
    /// stay withdrawable, reducible and terminable.
    pub fn disallow_token(&mut self, token: &TokenId) -> Result<()> {
        self.tokens
            .get_mut(token)
            .ok_or(HubError::UnknownToken)?
            .allowed = false;
        Ok(())
    }

    pub fn set_allowed_intervals(&mut self, mask: u8) {
        self.params.allowed_intervals = mask;
    }

    pub fn set_swap_fee(&mut self, fee: u32) -> Result<()> {
        validate_fee(fee)?;
        self.params.swap_fee = fee;
        Ok(())
    }

    pub fn set_loan_fee(&mut self, fee: u32) -> Result<()> {
        validate_fee(fee)?;
        self.params.loan_fee = fee;
        Ok(())
    }

    pub fn set_platform_fee_ratio(&mut self, ratio: u16) -> Result<()> {
        if ratio > MAX_PLATFORM_FEE_RATIO {
            return Err(HubError::FeeTooHigh);
        }
        self.params.platform_fee_ratio = ratio;
        Ok(())
    }

    pub fn set_imbalance_tolerance(&mut self, bps: u16) -> Result<()> {
        if bps > MAX_IMBALANCE_BPS {
            return Err(HubError::FeeTooHigh);
        }
        self.params.max_imbalance_bps = bps;
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.params.paused = paused;
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.params.paused
    }

    fn require_unpaused(&self) -> Result<()> {
        if self.params.paused {
            Err(HubError::Paused)
        } else {
            Ok(())
        }
    }

    // ========================================
    // Registry Accessors
    // ========================================

    pub fn token_meta(&self, token: &TokenId) -> Result<&TokenMeta> {
        self.tokens.get(token).ok_or(HubError::UnknownToken)
    }

    fn token_meta_mut(&mut self, token: &TokenId) -> Result<&mut TokenMeta> {
        self.tokens.get_mut(token).ok_or(HubError::UnknownToken)
    }

    fn require_allowed(&self, token: &TokenId) -> Result<&TokenMeta> {
        let meta = self.token_meta(token)?;
        if !meta.allowed {
            return Err(HubError::UnallowedToken);
        }
        Ok(meta)
    }

    pub fn token_magnitude(&self, token: &TokenId) -> Result<u64> {
        Ok(self.token_meta(token)?.magnitude)
    }

    pub fn balance_of(&self, token: &TokenId) -> u128 {
        self.tokens.get(token).map(|m| m.balance).unwrap_or(0)
    }

    pub fn platform_balance_of(&self, token: &TokenId) -> u128 {
        self.tokens.get(token).map(|m| m.platform_balance).unwrap_or(0)
    }

    pub fn position(&self, id: u64) -> Result<&Position> {
        self.positions.get(&id).ok_or(HubError::PositionNotFound)
    }

    /// Live aggregate rate for one direction of a (pair, interval), for
    /// inspection and tests.
    pub fn aggregate_rate(&self, pair: &PairKey, interval_mask: u8, from: &TokenId) -> u128 {
        self.pairs
            .get(pair)
            .and_then(|p| p.ledgers.get(&interval_mask))
            .map(|l| l.side(pair.direction(from)).rate)
            .unwrap_or(0)
    }

    /// Packed set of intervals with live positions for a pair.
    pub fn active_intervals(&self, pair: &PairKey) -> u8 {
        self.pairs.get(pair).map(|p| p.active_intervals).unwrap_or(0)
    }

    // ========================================
    // Position Store
    // ========================================

    /// Open a new position converting `amount` of `from` into `to` over
    /// `num_swaps` rounds of the given cadence. Returns the new position id;
    /// the wrapper pulls `amount` of `from` from the depositor.
    pub fn deposit(
        &mut self,
        from: TokenId,
        to: TokenId,
        interval_seconds: u32,
        amount: u64,
        num_swaps: u32,
        owner: [u8; 32],
    ) -> Result<u64> {
        self.require_unpaused()?;
        let mask = intervals::mask_for_seconds(interval_seconds)?;
        if !intervals::is_set(self.params.allowed_intervals, mask) {
            return Err(HubError::UnallowedInterval);
        }
        self.require_allowed(&from)?;
        self.require_allowed(&to)?;
        if num_swaps == 0 {
            return Err(HubError::ZeroSwaps);
        }
        if amount == 0 {
            return Err(HubError::ZeroAmount);
        }
        // Exact division only: a remainder would be silently unconvertible.
        if amount % num_swaps as u64 != 0 {
            return Err(HubError::AmountNotDivisible);
        }
        let rate = amount / num_swaps as u64;

        let pair = PairKey::new(from, to)?;
        let dir = pair.direction(&from);
        let performed = self.register_rate(&pair, mask, dir, rate, num_swaps)?;

        let meta = self.token_meta_mut(&from)?;
        meta.balance = credit_balance(meta.balance, amount as u128)?;

        let id = self.next_position_id;
        self.next_position_id += 1;
        self.positions.insert(
            id,
            Position {
                from,
                to,
                interval_mask: mask,
                rate,
                swaps_left: num_swaps,
                last_updated_swap: performed,
                pre_accumulated_swapped: 0,
                owner,
                operator: [0; 32],
                operator_permissions: 0,
            },
        );
        Ok(id)
    }

    /// Add `rate` to the live aggregate and register its expiry delta.
    /// Returns the ledger's current performed-swap count.
    fn register_rate(
        &mut self,
        pair: &PairKey,
        mask: u8,
        dir: usize,
        rate: u64,
        num_swaps: u32,
    ) -> Result<u32> {
        let state = self.pairs.entry(*pair).or_default();
        let ledger = state.ledgers.entry(mask).or_default();
        let performed = ledger.performed_swaps;
        let expiry = performed
            .checked_add(num_swaps)
            .and_then(|s| s.checked_add(1))
            .ok_or(HubError::Overflow)?;

        let side = ledger.side_mut(dir);
        side.rate = add_u128(side.rate, rate as u128)?;
        let slot = side.delta.entry(expiry).or_insert(0);
        *slot = slot.checked_sub(rate as i128).ok_or(HubError::Overflow)?;

        state.active_intervals |= mask;
        Ok(performed)
    }

    /// Remove a still-live position's rate from the aggregate and cancel its
    /// expiry delta. No-op for a position whose swaps already ran out.
    fn unregister_rate(&mut self, pos: &Position) -> Result<()> {
        if pos.swaps_left == 0 {
            return Ok(());
        }
        let pair = PairKey::new(pos.from, pos.to)?;
        let dir = pair.direction(&pos.from);
        let expiry = pos
            .last_updated_swap
            .checked_add(pos.swaps_left)
            .and_then(|s| s.checked_add(1))
            .ok_or(HubError::Overflow)?;

        let state = self.pairs.get_mut(&pair).ok_or(HubError::Overflow)?;
        let ledger = state.ledgers.get_mut(&pos.interval_mask).ok_or(HubError::Overflow)?;
        let side = ledger.side_mut(dir);
        side.rate = sub_u128(side.rate, pos.rate as u128)?;
        if let Some(slot) = side.delta.get_mut(&expiry) {
            *slot = slot.checked_add(pos.rate as i128).ok_or(HubError::Overflow)?;
            if *slot == 0 {
                side.delta.remove(&expiry);
            }
        }
        Self::refresh_active_bit(state, pos.interval_mask);
        Ok(())
    }

    /// Clear the cadence bit once both directions are idle.
    fn refresh_active_bit(state: &mut PairState, mask: u8) {
        if let Some(ledger) = state.ledgers.get(&mask) {
            if !ledger.has_live_rate() {
                state.active_intervals &= !mask;
            }
        }
    }

    /// Swap-number window a position can currently collect over:
    /// `s1` never reads past what has actually been settled.
    fn swapped_window(&self, pos: &Position) -> Result<(u32, u32)> {
        let pair = PairKey::new(pos.from, pos.to)?;
        let performed = self
            .pairs
            .get(&pair)
            .and_then(|p| p.ledgers.get(&pos.interval_mask))
            .map(|l| l.performed_swaps)
            .unwrap_or(0);
        let s0 = pos.last_updated_swap;
        let end = s0.checked_add(pos.swaps_left).ok_or(HubError::Overflow)?;
        // performed >= s0 always (s0 was read from performed_swaps at
        // registration); the max is belt only
        Ok((s0, core::cmp::max(s0, core::cmp::min(end, performed))))
    }

    /// Principal not yet converted by executed settlement rounds, in `from`
    /// units.
    pub fn unconverted_principal(&self, id: u64) -> Result<u128> {
        let pos = self.position(id)?;
        let (_, s1) = self.swapped_window(pos)?;
        let end = pos
            .last_updated_swap
            .checked_add(pos.swaps_left)
            .ok_or(HubError::Overflow)?;
        Ok(pos.rate as u128 * (end - s1) as u128)
    }

    /// Converted output currently owed to a position, in `to` units.
    pub fn swapped_amount(&self, id: u64) -> Result<u128> {
        let pos = self.position(id)?;
        let (s0, s1) = self.swapped_window(pos)?;
        if s1 <= s0 {
            return Ok(pos.pre_accumulated_swapped);
        }
        let pair = PairKey::new(pos.from, pos.to)?;
        let dir = pair.direction(&pos.from);
        let ledger = self
            .pairs
            .get(&pair)
            .and_then(|p| p.ledgers.get(&pos.interval_mask))
            .ok_or(HubError::Overflow)?;
        let side = ledger.side(dir);
        let delta = sub_u128(side.accum_at(s1)?, side.accum_at(s0)?)?;
        let magnitude = self.token_magnitude(&pos.from)? as u128;
        // Multiply before dividing: ratios are per-magnitude precisely so a
        // small rate times a large accumulated ratio keeps its precision.
        let converted = (pos.rate as u128)
            .checked_mul(delta)
            .ok_or(HubError::Overflow)?
            / magnitude;
        add_u128(pos.pre_accumulated_swapped, converted)
    }

    /// Collect owed output into `pre_accumulated_swapped` and advance the
    /// position's window, preserving the expiry-delta key invariant
    /// (`last_updated_swap + swaps_left` is unchanged).
    fn flush_swapped(&mut self, id: u64) -> Result<()> {
        let owed = self.swapped_amount(id)?;
        let pos_copy = *self.positions.get(&id).ok_or(HubError::PositionNotFound)?;
        let (s0, s1) = self.swapped_window(&pos_copy)?;
        let pos = self.positions.get_mut(&id).ok_or(HubError::PositionNotFound)?;
        pos.pre_accumulated_swapped = owed;
        pos.swaps_left -= s1 - s0;
        pos.last_updated_swap = s1;
        Ok(())
    }

    /// Withdraw all converted-but-unwithdrawn output. Zero owed is a no-op
    /// success. Returns the output token and amount for the wrapper to pay.
    pub fn withdraw_swapped(&mut self, id: u64, caller: &[u8; 32]) -> Result<(TokenId, u64)> {
        {
            let pos = self.position(id)?;
            if !pos.allows(caller, PERM_WITHDRAW) {
                return Err(HubError::Unauthorized);
            }
        }
        self.flush_swapped(id)?;
        let pos = self.positions.get_mut(&id).ok_or(HubError::PositionNotFound)?;
        let owed = pos.pre_accumulated_swapped;
        pos.pre_accumulated_swapped = 0;
        let to = pos.to;
        let amount = to_u64(owed)?;
        if amount > 0 {
            let meta = self.token_meta_mut(&to)?;
            meta.balance = sub_u128(meta.balance, owed)?;
        }
        Ok((to, amount))
    }

    /// Add principal to a position and re-spread it over `new_num_swaps`
    /// rounds. The wrapper pulls `extra` of `from` from the caller.
    pub fn increase_position(
        &mut self,
        id: u64,
        caller: &[u8; 32],
        extra: u64,
        new_num_swaps: u32,
    ) -> Result<()> {
        self.require_unpaused()?;
        {
            let pos = self.position(id)?;
            if !pos.allows(caller, PERM_INCREASE) {
                return Err(HubError::Unauthorized);
            }
            // New volume must not route through a since-disallowed token.
            self.require_allowed(&pos.from)?;
            self.require_allowed(&pos.to)?;
        }
        let from = self.position(id)?.from;
        self.reshape_position(id, extra as u128, true, new_num_swaps)?;
        if extra > 0 {
            let meta = self.token_meta_mut(&from)?;
            meta.balance = credit_balance(meta.balance, extra as u128)?;
        }
        Ok(())
    }

    /// Remove `removed` principal from a position and re-spread the rest over
    /// `new_num_swaps` rounds. Returns the amount for the wrapper to pay out.
    /// Reducing everything with `new_num_swaps == 0` is a partial terminate.
    pub fn reduce_position(
        &mut self,
        id: u64,
        caller: &[u8; 32],
        removed: u64,
        new_num_swaps: u32,
    ) -> Result<(TokenId, u64)> {
        {
            let pos = self.position(id)?;
            if !pos.allows(caller, PERM_REDUCE) {
                return Err(HubError::Unauthorized);
            }
        }
        let from = self.position(id)?.from;
        self.reshape_position(id, removed as u128, false, new_num_swaps)?;
        if removed > 0 {
            let meta = self.token_meta_mut(&from)?;
            meta.balance = sub_u128(meta.balance, removed as u128)?;
        }
        Ok((from, removed))
    }

    /// Shared increase/reduce core: validate the new shape, flush owed
    /// output, detach the old rate, re-register the new one.
    fn reshape_position(
        &mut self,
        id: u64,
        amount_delta: u128,
        is_increase: bool,
        new_num_swaps: u32,
    ) -> Result<()> {
        let live = self.unconverted_principal(id)?;
        let new_total = if is_increase {
            add_u128(live, amount_delta)?
        } else {
            live.checked_sub(amount_delta)
                .ok_or(HubError::InsufficientBalance)?
        };
        let new_rate = if new_total == 0 {
            if new_num_swaps != 0 {
                return Err(HubError::ZeroAmount);
            }
            0u64
        } else {
            if new_num_swaps == 0 {
                return Err(HubError::ZeroSwaps);
            }
            if new_total % new_num_swaps as u128 != 0 {
                return Err(HubError::AmountNotDivisible);
            }
            to_u64(new_total / new_num_swaps as u128)?
        };

        self.flush_swapped(id)?;
        let pos = *self.positions.get(&id).ok_or(HubError::PositionNotFound)?;
        self.unregister_rate(&pos)?;

        let registered_at = if new_rate != 0 {
            let pair = PairKey::new(pos.from, pos.to)?;
            let dir = pair.direction(&pos.from);
            self.register_rate(&pair, pos.interval_mask, dir, new_rate, new_num_swaps)?
        } else {
            pos.last_updated_swap
        };

        let pos = self.positions.get_mut(&id).ok_or(HubError::PositionNotFound)?;
        pos.rate = new_rate;
        pos.swaps_left = new_num_swaps;
        pos.last_updated_swap = registered_at;
        Ok(())
    }

    /// Close a position: return unconverted principal and owed output, then
    /// delete the id (ids are never reused).
    pub fn terminate(&mut self, id: u64, caller: &[u8; 32]) -> Result<TerminateOutcome> {
        {
            let pos = self.position(id)?;
            if !pos.allows(caller, PERM_TERMINATE) {
                return Err(HubError::Unauthorized);
            }
        }
        self.flush_swapped(id)?;
        let pos = *self.positions.get(&id).ok_or(HubError::PositionNotFound)?;
        self.unregister_rate(&pos)?;

        let unswapped = pos.remaining_principal();
        let swapped = pos.pre_accumulated_swapped;

        if unswapped > 0 {
            let meta = self.token_meta_mut(&pos.from)?;
            meta.balance = sub_u128(meta.balance, unswapped)?;
        }
        if swapped > 0 {
            let meta = self.token_meta_mut(&pos.to)?;
            meta.balance = sub_u128(meta.balance, swapped)?;
        }
        self.positions.remove(&id);
        Ok(TerminateOutcome {
            from: pos.from,
            to: pos.to,
            unswapped: to_u64(unswapped)?,
            swapped: to_u64(swapped)?,
        })
    }

    /// Grant (or revoke, with zero permissions) a delegate on a position.
    /// Owner only.
    pub fn set_operator(
        &mut self,
        id: u64,
        caller: &[u8; 32],
        operator: [u8; 32],
        permissions: u8,
    ) -> Result<()> {
        let pos = self.positions.get_mut(&id).ok_or(HubError::PositionNotFound)?;
        if pos.owner != *caller {
            return Err(HubError::Unauthorized);
        }
        pos.operator = operator;
        pos.operator_permissions = permissions & PERM_ALL;
        Ok(())
    }

    // ========================================
    // Settlement Engine
    // ========================================

    /// What a settlement of this basket would do right now: per-token
    /// provide/reward amounts and fees. Pure; imbalance and pause rules are
    /// not enforced so the result is usable for planning while paused.
    pub fn next_swap_info(
        &self,
        tokens: &[TokenId],
        pair_indexes: &[(u8, u8)],
        quotes: &[PairQuote],
        now: u64,
    ) -> Result<SettlementPlan> {
        self.plan_inner(tokens, pair_indexes, quotes, now, true)
    }

    /// Authoritative settlement plan. Validates pause state and, for
    /// non-privileged callers, the per-pair imbalance bound.
    pub fn plan_settlement(
        &self,
        tokens: &[TokenId],
        pair_indexes: &[(u8, u8)],
        quotes: &[PairQuote],
        now: u64,
        privileged: bool,
    ) -> Result<SettlementPlan> {
        self.require_unpaused()?;
        self.plan_inner(tokens, pair_indexes, quotes, now, privileged)
    }

    fn plan_inner(
        &self,
        tokens: &[TokenId],
        pair_indexes: &[(u8, u8)],
        quotes: &[PairQuote],
        now: u64,
        privileged: bool,
    ) -> Result<SettlementPlan> {
        // Token list: strictly ascending (unique), all allowed. Allowance is
        // re-validated even for tokens only flowing out: positions in
        // disallowed tokens stay withdrawable, but no new settlement volume
        // may route through them.
        if tokens.is_empty() {
            return Err(HubError::InvalidTokens);
        }
        for w in tokens.windows(2) {
            if w[0] >= w[1] {
                return Err(HubError::InvalidTokens);
            }
        }
        for token in tokens {
            self.require_allowed(token)?;
        }
        // Pair list: canonical (i < j), strictly ascending lexicographically.
        if pair_indexes.is_empty() || quotes.len() != pair_indexes.len() {
            return Err(HubError::InvalidTokens);
        }
        for w in pair_indexes.windows(2) {
            if w[0] >= w[1] {
                return Err(HubError::DuplicatePairs);
            }
        }

        let n = tokens.len();
        let mut needed = alloc::vec![0u128; n];
        let mut available = alloc::vec![0u128; n];
        let mut platform_fees = alloc::vec![0u128; n];
        let mut pair_plans = Vec::with_capacity(pair_indexes.len());

        for (&(ai, bi), quote) in pair_indexes.iter().zip(quotes.iter()) {
            let (ai, bi) = (ai as usize, bi as usize);
            if ai >= bi || bi >= n {
                return Err(HubError::InvalidTokens);
            }
            let pair = PairKey::new(tokens[ai], tokens[bi])?;
            let mag_a = self.token_magnitude(&pair.token_a)? as u128;
            let mag_b = self.token_magnitude(&pair.token_b)? as u128;

            let mut plan = PairSettlement { pair, intervals: Vec::new() };
            let state = match self.pairs.get(&pair) {
                Some(state) => state,
                None => {
                    pair_plans.push(plan);
                    continue;
                }
            };

            for (&mask, ledger) in state.ledgers.iter() {
                if !intervals::is_set(state.active_intervals, mask) {
                    continue;
                }
                if ledger.next_swap_available_at > now || !ledger.has_live_rate() {
                    continue;
                }
                if quote.ratio_a_to_b > MAX_RATIO || quote.ratio_b_to_a > MAX_RATIO {
                    return Err(HubError::Overflow);
                }
                let rate_ab = ledger.a_to_b.rate;
                let rate_ba = ledger.b_to_a.rate;

                // Gross conversion value of each side, both measured in B.
                let gross_out_b = mul_div(rate_ab, quote.ratio_a_to_b, mag_a)?;
                let gross_out_a = mul_div(rate_ba, quote.ratio_b_to_a, mag_b)?;

                if !privileged {
                    self.check_imbalance(gross_out_b, rate_ba)?;
                }

                let ratio_ab_net = if rate_ab > 0 {
                    subtract_fee(self.params.swap_fee, quote.ratio_a_to_b)?
                } else {
                    0
                };
                let ratio_ba_net = if rate_ba > 0 {
                    subtract_fee(self.params.swap_fee, quote.ratio_b_to_a)?
                } else {
                    0
                };
                // Inflow requirements round up: a position's later withdrawal
                // divides once over many swaps, which per-swap floors could
                // undercover but per-swap ceilings never do.
                let inflow_b = mul_div_ceil(rate_ab, ratio_ab_net, mag_a)?;
                let inflow_a = mul_div_ceil(rate_ba, ratio_ba_net, mag_b)?;

                // The platform takes its share of the fee on the gross
                // volume; the rest of the fee is the settler's spread (they
                // provide fee-reduced inflow against full-value outflow).
                let fee_b = fee_for_amount(self.params.swap_fee, gross_out_b)?;
                let fee_a = fee_for_amount(self.params.swap_fee, gross_out_a)?;
                let platform_b =
                    mul_div(fee_b, self.params.platform_fee_ratio as u128, FEE_PRECISION as u128)?;
                let platform_a =
                    mul_div(fee_a, self.params.platform_fee_ratio as u128, FEE_PRECISION as u128)?;

                needed[bi] = add_u128(needed[bi], add_u128(inflow_b, platform_b)?)?;
                needed[ai] = add_u128(needed[ai], add_u128(inflow_a, platform_a)?)?;
                available[ai] = add_u128(available[ai], rate_ab)?;
                available[bi] = add_u128(available[bi], rate_ba)?;
                platform_fees[bi] = add_u128(platform_fees[bi], platform_b)?;
                platform_fees[ai] = add_u128(platform_fees[ai], platform_a)?;

                plan.intervals.push(IntervalSettlement {
                    interval_mask: mask,
                    swap_number: ledger
                        .performed_swaps
                        .checked_add(1)
                        .ok_or(HubError::Overflow)?,
                    rate: [rate_ab, rate_ba],
                    ratio_with_fee: [ratio_ab_net, ratio_ba_net],
                });
            }
            pair_plans.push(plan);
        }

        let mut flows = Vec::with_capacity(n);
        for i in 0..n {
            let (to_provide, reward) = if needed[i] >= available[i] {
                (needed[i] - available[i], 0)
            } else {
                (0, available[i] - needed[i])
            };
            flows.push(TokenFlow {
                token: tokens[i],
                to_provide: to_u64(to_provide)?,
                reward: to_u64(reward)?,
                platform_fee: platform_fees[i],
            });
        }
        Ok(SettlementPlan { flows, pairs: pair_plans })
    }

    /// Bound on how lopsided one (pair, interval) round may be for a
    /// non-privileged settler: both sides valued in B units must differ by at
    /// most `max_imbalance_bps` of their sum. Caps the net value moved at a
    /// possibly-stale oracle price.
    fn check_imbalance(&self, side_a_in_b: u128, side_b: u128) -> Result<()> {
        let diff = if side_a_in_b >= side_b {
            side_a_in_b - side_b
        } else {
            side_b - side_a_in_b
        };
        let total = add_u128(side_a_in_b, side_b)?;
        let lhs = diff.checked_mul(MAX_IMBALANCE_BPS as u128).ok_or(HubError::Overflow)?;
        let rhs = total
            .checked_mul(self.params.max_imbalance_bps as u128)
            .ok_or(HubError::Overflow)?;
        if lhs > rhs {
            return Err(HubError::UnbalancedSettlement);
        }
        Ok(())
    }

    /// Apply a plan produced by `plan_settlement` against the same state.
    /// The wrapper calls this only after every repayment post-condition held.
    pub fn commit_settlement(&mut self, plan: &SettlementPlan, now: u64) -> Result<()> {
        for pair_plan in &plan.pairs {
            if pair_plan.intervals.is_empty() {
                continue;
            }
            let state = self.pairs.get_mut(&pair_plan.pair).ok_or(HubError::Overflow)?;
            for settled in &pair_plan.intervals {
                let seconds = intervals::seconds_for_mask(settled.interval_mask)? as u64;
                let ledger = state
                    .ledgers
                    .get_mut(&settled.interval_mask)
                    .ok_or(HubError::Overflow)?;
                // Plans are computed and committed within one operation; a
                // mismatch here means the wrapper reused a stale plan.
                if ledger.performed_swaps.checked_add(1) != Some(settled.swap_number) {
                    return Err(HubError::Overflow);
                }
                ledger.performed_swaps = settled.swap_number;
                for dir in 0..2 {
                    let side = ledger.side_mut(dir);
                    let prev = side.accum_at(settled.swap_number - 1)?;
                    let next = add_u128(prev, settled.ratio_with_fee[dir])?;
                    side.accum.insert(settled.swap_number, next);
                    // Expire rates whose final round was this one.
                    if let Some(delta) = side.delta.remove(&(settled.swap_number + 1)) {
                        let new_rate = (side.rate as i128)
                            .checked_add(delta)
                            .ok_or(HubError::Overflow)?;
                        if new_rate < 0 {
                            return Err(HubError::Overflow);
                        }
                        side.rate = new_rate as u128;
                    }
                }
                ledger.next_swap_available_at = now
                    .checked_div(seconds)
                    .and_then(|q| q.checked_add(1))
                    .and_then(|q| q.checked_mul(seconds))
                    .ok_or(HubError::Overflow)?;
                Self::refresh_active_bit(state, settled.interval_mask);
            }
        }
        for flow in &plan.flows {
            let meta = self.token_meta_mut(&flow.token)?;
            meta.balance = credit_balance(meta.balance, flow.to_provide as u128)?;
            meta.balance = sub_u128(meta.balance, flow.reward as u128)?;
            meta.platform_balance = add_u128(meta.platform_balance, flow.platform_fee)?;
        }
        Ok(())
    }

    /// Book a repayment surplus (anything returned beyond the exact required
    /// amount) into the platform balance.
    pub fn credit_platform_surplus(&mut self, token: &TokenId, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let meta = self.token_meta_mut(token)?;
        meta.balance = credit_balance(meta.balance, amount)?;
        meta.platform_balance = add_u128(meta.platform_balance, amount)?;
        Ok(())
    }

    // ========================================
    // Flash Loan Engine
    // ========================================

    /// Validate a loan request and compute the fee owed per token. Loans draw
    /// on the full book balance of any registered token, allowed or not.
    pub fn plan_flash_loan(&self, loans: &[(TokenId, u64)]) -> Result<Vec<u128>> {
        self.require_unpaused()?;
        if loans.is_empty() {
            return Err(HubError::InvalidTokens);
        }
        for w in loans.windows(2) {
            if w[0].0 >= w[1].0 {
                return Err(HubError::InvalidTokens);
            }
        }
        let mut fees = Vec::with_capacity(loans.len());
        for (token, amount) in loans {
            if *amount == 0 {
                return Err(HubError::ZeroAmount);
            }
            let meta = self.token_meta(token)?;
            if (*amount as u128) > meta.balance {
                return Err(HubError::InsufficientLiquidity);
            }
            fees.push(fee_for_amount(self.params.loan_fee, *amount as u128)?);
        }
        Ok(fees)
    }

    /// Book the net gain of a repaid loan (fee plus any surplus) into the
    /// platform balance.
    pub fn commit_flash_loan(&mut self, token: &TokenId, net_gain: u128) -> Result<()> {
        self.credit_platform_surplus(token, net_gain)
    }

    // ========================================
    // Platform Accounting
    // ========================================

    /// Pay out collected fees. The wrapper gates this behind its admin role.
    pub fn withdraw_platform_balance(&mut self, token: &TokenId, amount: u64) -> Result<()> {
        let meta = self.token_meta_mut(token)?;
        if meta.platform_balance < amount as u128 {
            return Err(HubError::InsufficientPlatformBalance);
        }
        meta.platform_balance -= amount as u128;
        meta.balance = sub_u128(meta.balance, amount as u128)?;
        Ok(())
    }

    // ========================================
    // Invariant Checking (test support)
    // ========================================

    /// One-sided conservation: for every token, the book balance covers the
    /// sum of remaining principal, owed output and platform fees. Settlement
    /// truncation always rounds in the hub's favor, so `>=` is the invariant;
    /// equality holds when every per-position division is exact.
    pub fn check_conservation(&self) -> bool {
        let mut owed: BTreeMap<TokenId, u128> = BTreeMap::new();
        for (&id, pos) in self.positions.iter() {
            let principal = match self.unconverted_principal(id) {
                Ok(v) => v,
                Err(_) => return false,
            };
            let entry = owed.entry(pos.from).or_insert(0);
            *entry = match entry.checked_add(principal) {
                Some(v) => v,
                None => return false,
            };
            let swapped = match self.swapped_amount(id) {
                Ok(v) => v,
                Err(_) => return false,
            };
            let entry = owed.entry(pos.to).or_insert(0);
            *entry = match entry.checked_add(swapped) {
                Some(v) => v,
                None => return false,
            };
        }
        for (token, meta) in self.tokens.iter() {
            let owed_here = owed.get(token).copied().unwrap_or(0);
            let expected = match owed_here.checked_add(meta.platform_balance) {
                Some(v) => v,
                None => return false,
            };
            if meta.balance < expected {
                return false;
            }
        }
        true
    }
}

#[inline]
fn validate_fee(fee: u32) -> Result<()> {
    if fee > MAX_FEE {
        Err(HubError::FeeTooHigh)
    } else {
        Ok(())
    }
}

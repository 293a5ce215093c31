//! Driphub: single-file Solana program wrapping the recurring-order
//! settlement engine.
//!
//! The slab account holds a Pod header, a Pod config block, and the
//! borsh-serialized engine. Token custody is one SPL vault per allowed
//! token under the `[b"vault", slab]` authority. Settlement and flash
//! loans hand control to a caller-supplied callback program mid-call and
//! verify vault balances afterwards; a lock byte in the header is
//! persisted before the handoff so reentrant instructions fail fast.

#![deny(unsafe_code)]

use solana_program::pubkey::Pubkey;

// 1. mod constants
pub mod constants {
    use core::mem::size_of;
    use crate::state::{HubConfig, SlabHeader};

    pub const MAGIC: u64 = 0x4452_4950_4855_4231; // "DRIPHUB1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<HubConfig>();

    /// u32 little-endian length prefix of the engine region
    pub const ENGINE_LEN_OFF: usize = HEADER_LEN + CONFIG_LEN;
    pub const ENGINE_OFF: usize = ENGINE_LEN_OFF + 4;

    /// Slabs are sized by the deployer; this is just the floor that fits the
    /// header, config and an empty engine.
    pub const MIN_SLAB_LEN: usize = 1024;

    pub const VAULT_SEED: &[u8] = b"vault";
}

// 2. mod error
pub mod error {
    use driphub::HubError;
    use num_derive::FromPrimitive;
    use solana_program::{decode_error::DecodeError, program_error::ProgramError};
    use thiserror::Error;

    #[derive(Clone, Debug, Eq, Error, FromPrimitive, PartialEq)]
    pub enum HubProgError {
        #[error("Slab magic mismatch")]
        InvalidMagic,
        #[error("Slab version mismatch")]
        InvalidVersion,
        #[error("Hub already initialized")]
        AlreadyInitialized,
        #[error("Hub not initialized")]
        NotInitialized,
        #[error("Slab account too small")]
        InvalidSlabLen,
        #[error("Engine state does not fit the slab account")]
        SlabCapacityExceeded,
        #[error("Vault token account mismatch")]
        InvalidVaultAta,
        #[error("Mint account mismatch")]
        InvalidMint,
        #[error("Price feed account mismatch")]
        InvalidOracleKey,
        #[error("Oracle price too old")]
        OracleStale,
        #[error("Oracle confidence interval too wide")]
        OracleConfTooWide,
        #[error("Oracle price unusable")]
        OracleInvalid,
        #[error("Expected account to be a signer")]
        ExpectedSigner,
        #[error("Expected account to be writable")]
        ExpectedWritable,
        #[error("Caller is not the hub admin")]
        AdminOnly,
        #[error("Reentrant call while the hub lock is held")]
        ReentrancyLocked,
        #[error("Callback did not return the required funds")]
        LiquidityNotReturned,
        #[error("Callback account list malformed")]
        InvalidCallbackAccounts,
        // Engine errors mapped:
        #[error("Engine: unrecognized interval")]
        EngineInvalidInterval,
        #[error("Engine: invalid interval mask")]
        EngineInvalidMask,
        #[error("Engine: interval not allowed")]
        EngineUnallowedInterval,
        #[error("Engine: token not allowed")]
        EngineUnallowedToken,
        #[error("Engine: token not registered")]
        EngineUnknownToken,
        #[error("Engine: pair tokens identical")]
        EngineSameToken,
        #[error("Engine: zero amount")]
        EngineZeroAmount,
        #[error("Engine: zero swaps")]
        EngineZeroSwaps,
        #[error("Engine: amount not divisible by swap count")]
        EngineAmountNotDivisible,
        #[error("Engine: token list invalid")]
        EngineInvalidTokens,
        #[error("Engine: pair list invalid")]
        EngineDuplicatePairs,
        #[error("Engine: position not found")]
        EnginePositionNotFound,
        #[error("Engine: unauthorized")]
        EngineUnauthorized,
        #[error("Engine: hub paused")]
        EnginePaused,
        #[error("Engine: insufficient position balance")]
        EngineInsufficientBalance,
        #[error("Engine: insufficient loanable balance")]
        EngineInsufficientLiquidity,
        #[error("Engine: insufficient platform balance")]
        EngineInsufficientPlatformBalance,
        #[error("Engine: settlement too unbalanced")]
        EngineUnbalancedSettlement,
        #[error("Engine: fee above ceiling")]
        EngineFeeTooHigh,
        #[error("Engine: arithmetic overflow")]
        EngineOverflow,
    }

    impl From<HubProgError> for ProgramError {
        fn from(e: HubProgError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for HubProgError {
        fn type_of() -> &'static str {
            "HubProgError"
        }
    }

    pub fn map_hub_error(e: HubError) -> ProgramError {
        let err = match e {
            HubError::InvalidInterval => HubProgError::EngineInvalidInterval,
            HubError::InvalidMask => HubProgError::EngineInvalidMask,
            HubError::UnallowedInterval => HubProgError::EngineUnallowedInterval,
            HubError::UnallowedToken => HubProgError::EngineUnallowedToken,
            HubError::UnknownToken => HubProgError::EngineUnknownToken,
            HubError::SameToken => HubProgError::EngineSameToken,
            HubError::ZeroAmount => HubProgError::EngineZeroAmount,
            HubError::ZeroSwaps => HubProgError::EngineZeroSwaps,
            HubError::AmountNotDivisible => HubProgError::EngineAmountNotDivisible,
            HubError::InvalidTokens => HubProgError::EngineInvalidTokens,
            HubError::DuplicatePairs => HubProgError::EngineDuplicatePairs,
            HubError::PositionNotFound => HubProgError::EnginePositionNotFound,
            HubError::Unauthorized => HubProgError::EngineUnauthorized,
            HubError::Paused => HubProgError::EnginePaused,
            HubError::InsufficientBalance => HubProgError::EngineInsufficientBalance,
            HubError::InsufficientLiquidity => HubProgError::EngineInsufficientLiquidity,
            HubError::InsufficientPlatformBalance => {
                HubProgError::EngineInsufficientPlatformBalance
            }
            HubError::UnbalancedSettlement => HubProgError::EngineUnbalancedSettlement,
            HubError::FeeTooHigh => HubProgError::EngineFeeTooHigh,
            HubError::Overflow => HubProgError::EngineOverflow,
        };
        err.into()
    }
}

// 3. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        InitHub {
            privileged_swapper: Pubkey,
            swap_fee: u32,
            loan_fee: u32,
            platform_fee_ratio: u16,
            max_imbalance_bps: u16,
            allowed_intervals: u8,
            max_staleness_slots: u64,
            conf_filter_bps: u16,
        },
        AllowToken { price_feed: Pubkey },
        DisallowToken,
        SetAllowedIntervals { mask: u8 },
        SetSwapFee { fee: u32 },
        SetLoanFee { fee: u32 },
        SetPlatformFeeRatio { ratio: u16 },
        SetImbalanceTolerance { bps: u16 },
        SetPause { paused: bool },
        SetPrivilegedSwapper { swapper: Pubkey },
        Deposit {
            amount: u64,
            num_swaps: u32,
            interval_seconds: u32,
            owner: Pubkey,
        },
        WithdrawSwapped { position_id: u64 },
        IncreasePosition { position_id: u64, amount: u64, new_num_swaps: u32 },
        ReducePosition { position_id: u64, amount: u64, new_num_swaps: u32 },
        TerminatePosition { position_id: u64 },
        SetPositionOperator { position_id: u64, operator: Pubkey, permissions: u8 },
        Settle {
            token_count: u8,
            pairs: Vec<(u8, u8)>,
            to_borrow: Vec<u64>,
            callback_data: Vec<u8>,
        },
        FlashLoan { amounts: Vec<u64>, callback_data: Vec<u8> },
        WithdrawPlatformBalance { amount: u64 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) =
                input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => Ok(Instruction::InitHub {
                    privileged_swapper: read_pubkey(&mut rest)?,
                    swap_fee: read_u32(&mut rest)?,
                    loan_fee: read_u32(&mut rest)?,
                    platform_fee_ratio: read_u16(&mut rest)?,
                    max_imbalance_bps: read_u16(&mut rest)?,
                    allowed_intervals: read_u8(&mut rest)?,
                    max_staleness_slots: read_u64(&mut rest)?,
                    conf_filter_bps: read_u16(&mut rest)?,
                }),
                1 => Ok(Instruction::AllowToken { price_feed: read_pubkey(&mut rest)? }),
                2 => Ok(Instruction::DisallowToken),
                3 => Ok(Instruction::SetAllowedIntervals { mask: read_u8(&mut rest)? }),
                4 => Ok(Instruction::SetSwapFee { fee: read_u32(&mut rest)? }),
                5 => Ok(Instruction::SetLoanFee { fee: read_u32(&mut rest)? }),
                6 => Ok(Instruction::SetPlatformFeeRatio { ratio: read_u16(&mut rest)? }),
                7 => Ok(Instruction::SetImbalanceTolerance { bps: read_u16(&mut rest)? }),
                8 => Ok(Instruction::SetPause { paused: read_u8(&mut rest)? != 0 }),
                9 => Ok(Instruction::SetPrivilegedSwapper { swapper: read_pubkey(&mut rest)? }),
                10 => Ok(Instruction::Deposit {
                    amount: read_u64(&mut rest)?,
                    num_swaps: read_u32(&mut rest)?,
                    interval_seconds: read_u32(&mut rest)?,
                    owner: read_pubkey(&mut rest)?,
                }),
                11 => Ok(Instruction::WithdrawSwapped { position_id: read_u64(&mut rest)? }),
                12 => Ok(Instruction::IncreasePosition {
                    position_id: read_u64(&mut rest)?,
                    amount: read_u64(&mut rest)?,
                    new_num_swaps: read_u32(&mut rest)?,
                }),
                13 => Ok(Instruction::ReducePosition {
                    position_id: read_u64(&mut rest)?,
                    amount: read_u64(&mut rest)?,
                    new_num_swaps: read_u32(&mut rest)?,
                }),
                14 => Ok(Instruction::TerminatePosition { position_id: read_u64(&mut rest)? }),
                15 => Ok(Instruction::SetPositionOperator {
                    position_id: read_u64(&mut rest)?,
                    operator: read_pubkey(&mut rest)?,
                    permissions: read_u8(&mut rest)?,
                }),
                16 => {
                    let token_count = read_u8(&mut rest)?;
                    let pair_count = read_u8(&mut rest)?;
                    let mut pairs = Vec::with_capacity(pair_count as usize);
                    for _ in 0..pair_count {
                        let a = read_u8(&mut rest)?;
                        let b = read_u8(&mut rest)?;
                        pairs.push((a, b));
                    }
                    let mut to_borrow = Vec::with_capacity(token_count as usize);
                    for _ in 0..token_count {
                        to_borrow.push(read_u64(&mut rest)?);
                    }
                    let callback_data = read_bytes(&mut rest)?;
                    Ok(Instruction::Settle { token_count, pairs, to_borrow, callback_data })
                }
                17 => {
                    let token_count = read_u8(&mut rest)?;
                    let mut amounts = Vec::with_capacity(token_count as usize);
                    for _ in 0..token_count {
                        amounts.push(read_u64(&mut rest)?);
                    }
                    let callback_data = read_bytes(&mut rest)?;
                    Ok(Instruction::FlashLoan { amounts, callback_data })
                }
                18 => Ok(Instruction::WithdrawPlatformBalance { amount: read_u64(&mut rest)? }),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        if input.len() < 4 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(4);
        *input = rest;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }

    /// u16 length prefix + raw bytes.
    fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, ProgramError> {
        let len = read_u16(input)? as usize;
        if input.len() < len {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(len);
        *input = rest;
        Ok(bytes.to_vec())
    }
}

// 4. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::VAULT_SEED;
    use crate::error::HubProgError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(HubProgError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(HubProgError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, slab_key.as_ref()], program_id)
    }
}

// 5. mod state
pub mod state {
    use borsh::BorshDeserialize;
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use driphub::HubEngine;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::constants::{CONFIG_LEN, ENGINE_LEN_OFF, ENGINE_OFF, HEADER_LEN};
    use crate::error::HubProgError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        /// Reentrancy lock byte; nonzero while an operation is in flight
        pub locked: u8,
        pub _padding: [u8; 2],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct HubConfig {
        pub privileged_swapper: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub _padding: [u8; 6],
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> HubConfig {
        let mut c = HubConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &HubConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_engine(data: &[u8]) -> Result<HubEngine, ProgramError> {
        if data.len() < ENGINE_OFF {
            return Err(HubProgError::InvalidSlabLen.into());
        }
        let len_bytes: [u8; 4] = data[ENGINE_LEN_OFF..ENGINE_OFF]
            .try_into()
            .map_err(|_| ProgramError::InvalidAccountData)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if data.len() < ENGINE_OFF + len {
            return Err(ProgramError::InvalidAccountData);
        }
        HubEngine::try_from_slice(&data[ENGINE_OFF..ENGINE_OFF + len])
            .map_err(|_| ProgramError::InvalidAccountData)
    }

    pub fn write_engine(data: &mut [u8], engine: &HubEngine) -> Result<(), ProgramError> {
        let bytes = borsh::to_vec(engine).map_err(|_| ProgramError::InvalidAccountData)?;
        if data.len() < ENGINE_OFF || data.len() - ENGINE_OFF < bytes.len() {
            return Err(HubProgError::SlabCapacityExceeded.into());
        }
        let len = bytes.len() as u32;
        data[ENGINE_LEN_OFF..ENGINE_OFF].copy_from_slice(&len.to_le_bytes());
        data[ENGINE_OFF..ENGINE_OFF + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}

// 6. mod guard
pub mod guard {
    use solana_program::program_error::ProgramError;
    use crate::error::HubProgError;
    use crate::state;

    /// Take the hub-wide lock, persisting it into the slab immediately so a
    /// reentrant instruction (e.g. from inside a flash callback's CPI stack)
    /// observes it. Release on error paths comes from transaction atomicity:
    /// if the instruction returns Err, the whole transaction aborts and the
    /// byte reverts with it.
    pub fn acquire(data: &mut [u8]) -> Result<(), ProgramError> {
        let mut header = state::read_header(data);
        if header.locked != 0 {
            return Err(HubProgError::ReentrancyLocked.into());
        }
        header.locked = 1;
        state::write_header(data, &header);
        Ok(())
    }

    pub fn release(data: &mut [u8]) {
        let mut header = state::read_header(data);
        header.locked = 0;
        state::write_header(data, &header);
    }
}

// 7. mod oracle
pub mod oracle {
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::error::{map_hub_error, HubProgError};

    /// Read a raw price account (exponent, price, confidence, publish slot at
    /// the classic offsets) and normalize the price to 1e6 scale, rejecting
    /// stale or wide-confidence readings.
    pub fn read_price_e6(
        price_ai: &AccountInfo,
        now_slot: u64,
        max_staleness: u64,
        conf_bps: u16,
    ) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < 208 {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(*array_ref![data, 20, 4]);
        let price = i64::from_le_bytes(*array_ref![data, 176, 8]);
        let conf = u64::from_le_bytes(*array_ref![data, 184, 8]);
        let pub_slot = u64::from_le_bytes(*array_ref![data, 200, 8]);

        if price <= 0 {
            return Err(HubProgError::OracleInvalid.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(HubProgError::OracleStale.into());
        }

        let price_u = price as u128;
        let lhs = (conf as u128) * 10_000;
        let rhs = price_u * (conf_bps as u128);
        if lhs > rhs {
            return Err(HubProgError::OracleConfTooWide.into());
        }

        let scale = expo + 6;
        let final_price = if scale >= 0 {
            let mul = 10u128.pow(scale as u32);
            price_u.checked_mul(mul).ok_or(HubProgError::EngineOverflow)?
        } else {
            let div = 10u128.pow((-scale) as u32);
            price_u / div
        };

        if final_price == 0 {
            return Err(HubProgError::OracleInvalid.into());
        }
        u64::try_from(final_price).map_err(|_| HubProgError::EngineOverflow.into())
    }

    /// Output-token base units received per one whole (magnitude-sized) unit
    /// of the input token, given both tokens' 1e6 whole-token prices.
    pub fn pair_ratio(
        price_in_e6: u64,
        price_out_e6: u64,
        magnitude_out: u64,
    ) -> Result<u128, ProgramError> {
        driphub::mul_div(price_in_e6 as u128, magnitude_out as u128, price_out_e6 as u128)
            .map_err(map_hub_error)
    }
}

// 8. mod collateral
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(target_os = "solana")]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(not(target_os = "solana"))]
    use solana_program::program_pack::Pack;
    #[cfg(not(target_os = "solana"))]
    use spl_token::state::Account as TokenAccount;

    /// Pull tokens from a user account into a vault (user signature).
    pub fn transfer_in<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(target_os = "solana")]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(not(target_os = "solana"))]
        {
            shim_transfer(source, dest, amount)
        }
    }

    /// Push tokens out of a vault (vault-authority PDA signature).
    pub fn transfer_out<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(target_os = "solana")]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
                _signer_seeds,
            )
        }
        #[cfg(not(target_os = "solana"))]
        {
            shim_transfer(source, dest, amount)
        }
    }

    /// Host-build stand-in for the token program: mutate the packed token
    /// account state directly, so the full instruction surface runs in unit
    /// and integration tests without a runtime.
    #[cfg(not(target_os = "solana"))]
    fn shim_transfer(
        source: &AccountInfo,
        dest: &AccountInfo,
        amount: u64,
    ) -> Result<(), ProgramError> {
        let mut src_data = source.try_borrow_mut_data()?;
        let mut src_state = TokenAccount::unpack(&src_data)?;
        src_state.amount =
            src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(src_state, &mut src_data)?;

        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount =
            dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }

    /// Host-build helper shared with the callback shim: credit a token
    /// account.
    #[cfg(not(target_os = "solana"))]
    pub fn shim_credit(dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount =
            dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }
}

// 9. mod callback
pub mod callback {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    #[cfg(target_os = "solana")]
    use solana_program::{
        instruction::{AccountMeta, Instruction as SolInstruction},
        program::invoke,
    };

    pub const SETTLEMENT_CALLBACK_TAG: u8 = 0;
    pub const LOAN_CALLBACK_TAG: u8 = 1;

    /// Per-token amounts handed to the callback target.
    pub struct CallbackToken {
        pub mint: Pubkey,
        /// Settlement: amount the target must source. Loan: amount loaned.
        pub owed: u64,
        /// Settlement: amount borrowed up front. Loan: fee owed on top.
        pub extra: u64,
    }

    /// Encode the callback instruction data:
    /// tag, initiator, fee rate (loans; 0 for settlements), token triples,
    /// then the caller-supplied payload.
    pub fn encode(
        tag: u8,
        initiator: &Pubkey,
        fee_rate: u32,
        tokens: &[CallbackToken],
        payload: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(40 + tokens.len() * 48 + payload.len());
        data.push(tag);
        data.extend_from_slice(initiator.as_ref());
        data.extend_from_slice(&fee_rate.to_le_bytes());
        data.push(tokens.len() as u8);
        for t in tokens {
            data.extend_from_slice(t.mint.as_ref());
            data.extend_from_slice(&t.owed.to_le_bytes());
            data.extend_from_slice(&t.extra.to_le_bytes());
        }
        data.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    /// Hand control to the callback program. On-chain this is a real CPI
    /// with the recipient accounts plus any caller-forwarded extras.
    ///
    /// In host builds the CPI is replaced by a repayment shim: the
    /// caller-supplied payload is read as little-endian u64 amounts, one per
    /// vault, and credited directly — so exact, short and surplus repayments
    /// are all exercisable in tests.
    #[cfg(target_os = "solana")]
    pub fn invoke_callback<'a>(
        callback_program: &AccountInfo<'a>,
        forwarded: &[AccountInfo<'a>],
        _vaults: &[&AccountInfo<'a>],
        data: Vec<u8>,
        _payload: &[u8],
    ) -> ProgramResult {
        let mut metas = Vec::with_capacity(forwarded.len());
        for acc in forwarded {
            metas.push(if acc.is_writable {
                AccountMeta::new(*acc.key, acc.is_signer)
            } else {
                AccountMeta::new_readonly(*acc.key, acc.is_signer)
            });
        }
        let ix = SolInstruction { program_id: *callback_program.key, accounts: metas, data };
        let mut infos = Vec::with_capacity(forwarded.len() + 1);
        infos.extend_from_slice(forwarded);
        infos.push(callback_program.clone());
        invoke(&ix, &infos)
    }

    #[cfg(not(target_os = "solana"))]
    pub fn invoke_callback<'a>(
        _callback_program: &AccountInfo<'a>,
        _forwarded: &[AccountInfo<'a>],
        vaults: &[&AccountInfo<'a>],
        _data: Vec<u8>,
        payload: &[u8],
    ) -> ProgramResult {
        for (i, vault) in vaults.iter().enumerate() {
            let off = i * 8;
            if payload.len() >= off + 8 {
                let mut amount_bytes = [0u8; 8];
                amount_bytes.copy_from_slice(&payload[off..off + 8]);
                let amount = u64::from_le_bytes(amount_bytes);
                if amount > 0 {
                    crate::collateral::shim_credit(vault, amount)?;
                }
            }
        }
        Ok(())
    }
}

// 10. mod processor
pub mod processor {
    use driphub::{HubEngine, HubParams, PairQuote, TokenId};
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };
    use crate::{
        accounts, callback, collateral,
        constants::{MAGIC, MIN_SLAB_LEN, VAULT_SEED, VERSION},
        error::{map_hub_error, HubProgError},
        guard,
        ix::Instruction,
        oracle,
        state::{self, HubConfig, SlabHeader},
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() < MIN_SLAB_LEN {
            return Err(HubProgError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<SlabHeader, ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(HubProgError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(HubProgError::InvalidVersion.into());
        }
        Ok(h)
    }

    fn require_admin(header: &SlabHeader, ai: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(ai)?;
        if header.admin != ai.key.to_bytes() {
            return Err(HubProgError::AdminOnly.into());
        }
        Ok(())
    }

    /// A vault is the exact token account recorded at allow-time: right key,
    /// right mint, owned by the vault-authority PDA.
    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_key: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_key {
            return Err(HubProgError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(HubProgError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(HubProgError::InvalidVaultAta.into());
        }
        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(HubProgError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(HubProgError::InvalidVaultAta.into());
        }
        Ok(())
    }

    fn token_account_amount(ai: &AccountInfo) -> Result<u64, ProgramError> {
        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        Ok(tok.amount)
    }

    fn vault_signer_bump(header: &SlabHeader) -> [u8; 1] {
        [header.bump]
    }

    pub fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            // Accounts: [admin (signer), slab (writable)]
            Instruction::InitHub {
                privileged_swapper,
                swap_fee,
                loan_fee,
                platform_fee_ratio,
                max_imbalance_bps,
                allowed_intervals,
                max_staleness_slots,
                conf_filter_bps,
            } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(HubProgError::AlreadyInitialized.into());
                }

                let (_auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);

                for b in data.iter_mut() {
                    *b = 0;
                }

                let engine = HubEngine::new(HubParams {
                    swap_fee,
                    loan_fee,
                    platform_fee_ratio,
                    max_imbalance_bps,
                    allowed_intervals,
                    paused: false,
                })
                .map_err(map_hub_error)?;
                state::write_engine(&mut data, &engine)?;

                let config = HubConfig {
                    privileged_swapper: privileged_swapper.to_bytes(),
                    max_staleness_slots,
                    conf_filter_bps,
                    _padding: [0; 6],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    locked: 0,
                    _padding: [0; 2],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }

            // Accounts: [admin (signer), slab (writable), mint, vault]
            Instruction::AllowToken { price_feed } => {
                accounts::expect_len(accounts, 4)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_writable(a_slab)?;
                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;
                guard::acquire(&mut data)?;

                accounts::expect_owner(a_mint, &spl_token::ID)?;
                let decimals = {
                    let mint_data = a_mint.try_borrow_data()?;
                    spl_token::state::Mint::unpack(&mint_data)?.decimals
                };
                let magnitude = 10u64
                    .checked_pow(decimals as u32)
                    .ok_or(HubProgError::EngineOverflow)?;

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                let mut engine = state::read_engine(&data)?;
                engine
                    .allow_token(
                        a_mint.key.to_bytes(),
                        magnitude,
                        price_feed.to_bytes(),
                        a_vault.key.to_bytes(),
                    )
                    .map_err(map_hub_error)?;
                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [admin (signer), slab (writable), mint]
            Instruction::DisallowToken => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];

                accounts::expect_writable(a_slab)?;
                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                engine.disallow_token(&a_mint.key.to_bytes()).map_err(map_hub_error)?;
                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [admin (signer), slab (writable)]
            Instruction::SetAllowedIntervals { mask } => {
                admin_engine_op(program_id, accounts, |engine| {
                    engine.set_allowed_intervals(mask);
                    Ok(())
                })?;
            }
            Instruction::SetSwapFee { fee } => {
                admin_engine_op(program_id, accounts, |engine| engine.set_swap_fee(fee))?;
            }
            Instruction::SetLoanFee { fee } => {
                admin_engine_op(program_id, accounts, |engine| engine.set_loan_fee(fee))?;
            }
            Instruction::SetPlatformFeeRatio { ratio } => {
                admin_engine_op(program_id, accounts, |engine| {
                    engine.set_platform_fee_ratio(ratio)
                })?;
            }
            Instruction::SetImbalanceTolerance { bps } => {
                admin_engine_op(program_id, accounts, |engine| {
                    engine.set_imbalance_tolerance(bps)
                })?;
            }
            Instruction::SetPause { paused } => {
                admin_engine_op(program_id, accounts, |engine| {
                    engine.set_paused(paused);
                    Ok(())
                })?;
            }

            // Accounts: [admin (signer), slab (writable)]
            Instruction::SetPrivilegedSwapper { swapper } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;
                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;
                guard::acquire(&mut data)?;

                let mut config = state::read_config(&data);
                config.privileged_swapper = swapper.to_bytes();
                state::write_config(&mut data, &config);
                guard::release(&mut data);
            }

            // Accounts: [depositor (signer), slab (writable), from mint,
            //            to mint, depositor from-token account (writable),
            //            from vault (writable), token program]
            Instruction::Deposit { amount, num_swaps, interval_seconds, owner } => {
                accounts::expect_len(accounts, 7)?;
                let a_depositor = &accounts[0];
                let a_slab = &accounts[1];
                let a_from_mint = &accounts[2];
                let a_to_mint = &accounts[3];
                let a_source = &accounts[4];
                let a_vault = &accounts[5];
                let a_token = &accounts[6];

                accounts::expect_signer(a_depositor)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                let from = a_from_mint.key.to_bytes();
                let expected_vault =
                    Pubkey::new_from_array(engine.token_meta(&from).map_err(map_hub_error)?.vault);
                verify_vault(a_vault, &auth, a_from_mint.key, &expected_vault)?;

                let id = engine
                    .deposit(
                        from,
                        a_to_mint.key.to_bytes(),
                        interval_seconds,
                        amount,
                        num_swaps,
                        owner.to_bytes(),
                    )
                    .map_err(map_hub_error)?;

                collateral::transfer_in(a_token, a_source, a_vault, a_depositor, amount)?;

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
                msg!("driphub: minted position {}", id);
            }

            // Accounts: [caller (signer), slab (writable), to mint,
            //            to vault (writable), recipient token account
            //            (writable), vault authority, token program]
            Instruction::WithdrawSwapped { position_id } => {
                accounts::expect_len(accounts, 7)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_to_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_recipient = &accounts[4];
                let a_vault_pda = &accounts[5];
                let a_token = &accounts[6];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let (to, amount) = engine
                    .withdraw_swapped(position_id, &a_caller.key.to_bytes())
                    .map_err(map_hub_error)?;
                if to != a_to_mint.key.to_bytes() {
                    return Err(HubProgError::InvalidMint.into());
                }

                if amount > 0 {
                    let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                    accounts::expect_key(a_vault_pda, &auth)?;
                    let expected_vault = Pubkey::new_from_array(
                        engine.token_meta(&to).map_err(map_hub_error)?.vault,
                    );
                    verify_vault(a_vault, &auth, a_to_mint.key, &expected_vault)?;

                    let bump = vault_signer_bump(&header);
                    let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];
                    collateral::transfer_out(
                        a_token, a_vault, a_recipient, a_vault_pda, amount, &[&seeds],
                    )?;
                }

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [caller (signer), slab (writable), from mint,
            //            caller from-token account (writable),
            //            from vault (writable), token program]
            Instruction::IncreasePosition { position_id, amount, new_num_swaps } => {
                accounts::expect_len(accounts, 6)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_from_mint = &accounts[2];
                let a_source = &accounts[3];
                let a_vault = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let from = engine.position(position_id).map_err(map_hub_error)?.from;
                if from != a_from_mint.key.to_bytes() {
                    return Err(HubProgError::InvalidMint.into());
                }
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                let expected_vault =
                    Pubkey::new_from_array(engine.token_meta(&from).map_err(map_hub_error)?.vault);
                verify_vault(a_vault, &auth, a_from_mint.key, &expected_vault)?;

                engine
                    .increase_position(position_id, &a_caller.key.to_bytes(), amount, new_num_swaps)
                    .map_err(map_hub_error)?;

                if amount > 0 {
                    collateral::transfer_in(a_token, a_source, a_vault, a_caller, amount)?;
                }

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [caller (signer), slab (writable), from mint,
            //            from vault (writable), recipient token account
            //            (writable), vault authority, token program]
            Instruction::ReducePosition { position_id, amount, new_num_swaps } => {
                accounts::expect_len(accounts, 7)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_from_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_recipient = &accounts[4];
                let a_vault_pda = &accounts[5];
                let a_token = &accounts[6];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let (from, paid) = engine
                    .reduce_position(position_id, &a_caller.key.to_bytes(), amount, new_num_swaps)
                    .map_err(map_hub_error)?;
                if from != a_from_mint.key.to_bytes() {
                    return Err(HubProgError::InvalidMint.into());
                }

                if paid > 0 {
                    let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                    accounts::expect_key(a_vault_pda, &auth)?;
                    let expected_vault = Pubkey::new_from_array(
                        engine.token_meta(&from).map_err(map_hub_error)?.vault,
                    );
                    verify_vault(a_vault, &auth, a_from_mint.key, &expected_vault)?;
                    let bump = vault_signer_bump(&header);
                    let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];
                    collateral::transfer_out(
                        a_token, a_vault, a_recipient, a_vault_pda, paid, &[&seeds],
                    )?;
                }

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [caller (signer), slab (writable), from mint, to mint,
            //            from vault (writable), to vault (writable),
            //            unswapped recipient (writable), swapped recipient
            //            (writable), vault authority, token program]
            Instruction::TerminatePosition { position_id } => {
                accounts::expect_len(accounts, 10)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_from_mint = &accounts[2];
                let a_to_mint = &accounts[3];
                let a_from_vault = &accounts[4];
                let a_to_vault = &accounts[5];
                let a_unswapped_to = &accounts[6];
                let a_swapped_to = &accounts[7];
                let a_vault_pda = &accounts[8];
                let a_token = &accounts[9];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let outcome = engine
                    .terminate(position_id, &a_caller.key.to_bytes())
                    .map_err(map_hub_error)?;
                if outcome.from != a_from_mint.key.to_bytes()
                    || outcome.to != a_to_mint.key.to_bytes()
                {
                    return Err(HubProgError::InvalidMint.into());
                }

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let bump = vault_signer_bump(&header);
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];

                if outcome.unswapped > 0 {
                    let expected = Pubkey::new_from_array(
                        engine.token_meta(&outcome.from).map_err(map_hub_error)?.vault,
                    );
                    verify_vault(a_from_vault, &auth, a_from_mint.key, &expected)?;
                    collateral::transfer_out(
                        a_token,
                        a_from_vault,
                        a_unswapped_to,
                        a_vault_pda,
                        outcome.unswapped,
                        &[&seeds],
                    )?;
                }
                if outcome.swapped > 0 {
                    let expected = Pubkey::new_from_array(
                        engine.token_meta(&outcome.to).map_err(map_hub_error)?.vault,
                    );
                    verify_vault(a_to_vault, &auth, a_to_mint.key, &expected)?;
                    collateral::transfer_out(
                        a_token,
                        a_to_vault,
                        a_swapped_to,
                        a_vault_pda,
                        outcome.swapped,
                        &[&seeds],
                    )?;
                }

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
                msg!("driphub: burned position {}", position_id);
            }

            // Accounts: [caller (signer), slab (writable)]
            Instruction::SetPositionOperator { position_id, operator, permissions } => {
                accounts::expect_len(accounts, 2)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                engine
                    .set_operator(
                        position_id,
                        &a_caller.key.to_bytes(),
                        operator.to_bytes(),
                        permissions,
                    )
                    .map_err(map_hub_error)?;
                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }

            // Accounts: [caller (signer), slab (writable), clock, token
            //            program, vault authority, callback program,
            //            then per token i: mint, price feed, vault
            //            (writable), recipient (writable); any further
            //            accounts are forwarded to the callback]
            Instruction::Settle { token_count, pairs, to_borrow, callback_data } => {
                process_settle(program_id, accounts, token_count, pairs, to_borrow, callback_data)?;
            }

            // Accounts: [caller (signer), slab (writable), token program,
            //            vault authority, callback program, then per token i:
            //            mint, vault (writable), recipient (writable); any
            //            further accounts are forwarded to the callback]
            Instruction::FlashLoan { amounts, callback_data } => {
                process_flash_loan(program_id, accounts, amounts, callback_data)?;
            }

            // Accounts: [admin (signer), slab (writable), mint, vault
            //            (writable), recipient token account (writable),
            //            vault authority, token program]
            Instruction::WithdrawPlatformBalance { amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_recipient = &accounts[4];
                let a_vault_pda = &accounts[5];
                let a_token = &accounts[6];

                accounts::expect_writable(a_slab)?;
                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;
                guard::acquire(&mut data)?;

                let mut engine = state::read_engine(&data)?;
                let token = a_mint.key.to_bytes();
                engine.withdraw_platform_balance(&token, amount).map_err(map_hub_error)?;

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let expected_vault =
                    Pubkey::new_from_array(engine.token_meta(&token).map_err(map_hub_error)?.vault);
                verify_vault(a_vault, &auth, a_mint.key, &expected_vault)?;
                let bump = vault_signer_bump(&header);
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];
                collateral::transfer_out(a_token, a_vault, a_recipient, a_vault_pda, amount, &[&seeds])?;

                state::write_engine(&mut data, &engine)?;
                guard::release(&mut data);
            }
        }
        Ok(())
    }

    /// Shared shape of the parameter-setter instructions:
    /// accounts [admin (signer), slab (writable)], one engine mutation.
    fn admin_engine_op(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        op: impl FnOnce(&mut HubEngine) -> driphub::Result<()>,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 2)?;
        let a_admin = &accounts[0];
        let a_slab = &accounts[1];

        accounts::expect_writable(a_slab)?;
        let mut data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        let header = require_initialized(&data)?;
        require_admin(&header, a_admin)?;
        guard::acquire(&mut data)?;

        let mut engine = state::read_engine(&data)?;
        op(&mut engine).map_err(map_hub_error)?;
        state::write_engine(&mut data, &engine)?;
        guard::release(&mut data);
        Ok(())
    }

    fn process_settle<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        token_count: u8,
        pairs: Vec<(u8, u8)>,
        to_borrow: Vec<u64>,
        callback_data: Vec<u8>,
    ) -> ProgramResult {
        let n = token_count as usize;
        accounts::expect_len(accounts, 6 + 4 * n)?;
        let a_caller = &accounts[0];
        let a_slab = &accounts[1];
        let a_clock = &accounts[2];
        let a_token = &accounts[3];
        let a_vault_pda = &accounts[4];
        let a_callback = &accounts[5];
        let per_token = &accounts[6..6 + 4 * n];
        let forwarded_extra = &accounts[6 + 4 * n..];

        accounts::expect_signer(a_caller)?;
        accounts::expect_writable(a_slab)?;
        if to_borrow.len() != n {
            return Err(HubProgError::InvalidCallbackAccounts.into());
        }

        let clock = Clock::from_account_info(a_clock)?;
        let now = u64::try_from(clock.unix_timestamp)
            .map_err(|_| ProgramError::InvalidAccountData)?;

        let mints: Vec<&AccountInfo> = (0..n).map(|i| &per_token[4 * i]).collect();
        let feeds: Vec<&AccountInfo> = (0..n).map(|i| &per_token[4 * i + 1]).collect();
        let vaults: Vec<&AccountInfo> = (0..n).map(|i| &per_token[4 * i + 2]).collect();
        let recipients: Vec<&AccountInfo> = (0..n).map(|i| &per_token[4 * i + 3]).collect();

        // Phase 1: validate, lock, plan. The lock byte is persisted before
        // any control leaves this program.
        let (header, plan) = {
            let mut data = state::slab_data_mut(a_slab)?;
            slab_guard(program_id, a_slab, &data)?;
            let header = require_initialized(&data)?;
            let config = state::read_config(&data);
            guard::acquire(&mut data)?;

            let engine = state::read_engine(&data)?;
            let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
            accounts::expect_key(a_vault_pda, &auth)?;

            let tokens: Vec<TokenId> = mints.iter().map(|m| m.key.to_bytes()).collect();
            let mut prices = Vec::with_capacity(n);
            for i in 0..n {
                let meta = engine.token_meta(&tokens[i]).map_err(map_hub_error)?;
                if feeds[i].key.to_bytes() != meta.price_feed {
                    return Err(HubProgError::InvalidOracleKey.into());
                }
                verify_vault(
                    vaults[i],
                    &auth,
                    mints[i].key,
                    &Pubkey::new_from_array(meta.vault),
                )?;
                prices.push(oracle::read_price_e6(
                    feeds[i],
                    clock.slot,
                    config.max_staleness_slots,
                    config.conf_filter_bps,
                )?);
            }

            let mut quotes = Vec::with_capacity(pairs.len());
            for &(ai, bi) in &pairs {
                let (ai, bi) = (ai as usize, bi as usize);
                if ai >= n || bi >= n {
                    return Err(HubProgError::EngineInvalidTokens.into());
                }
                let mag_a = engine.token_magnitude(&tokens[ai]).map_err(map_hub_error)?;
                let mag_b = engine.token_magnitude(&tokens[bi]).map_err(map_hub_error)?;
                quotes.push(PairQuote {
                    ratio_a_to_b: oracle::pair_ratio(prices[ai], prices[bi], mag_b)?,
                    ratio_b_to_a: oracle::pair_ratio(prices[bi], prices[ai], mag_a)?,
                });
            }

            let privileged = config.privileged_swapper == a_caller.key.to_bytes();
            let plan = engine
                .plan_settlement(&tokens, &pairs, &quotes, now, privileged)
                .map_err(map_hub_error)?;
            (header, plan)
        };

        // Phase 2: pre-balances, outbound transfers, callback.
        let mut pre_balances = Vec::with_capacity(n);
        for vault in &vaults {
            pre_balances.push(token_account_amount(vault)?);
        }

        let bump = vault_signer_bump(&header);
        let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];
        let mut cb_tokens = Vec::with_capacity(n);
        for i in 0..n {
            let flow = &plan.flows[i];
            let out = flow
                .reward
                .checked_add(to_borrow[i])
                .ok_or(HubProgError::EngineOverflow)?;
            if out > 0 {
                collateral::transfer_out(
                    a_token, vaults[i], recipients[i], a_vault_pda, out, &[&seeds],
                )?;
            }
            cb_tokens.push(callback::CallbackToken {
                mint: *mints[i].key,
                owed: flow.to_provide,
                extra: to_borrow[i],
            });
        }

        let cb_data = callback::encode(
            callback::SETTLEMENT_CALLBACK_TAG,
            a_caller.key,
            0,
            &cb_tokens,
            &callback_data,
        );
        let mut forwarded: Vec<AccountInfo> = recipients.iter().map(|r| (*r).clone()).collect();
        forwarded.extend(forwarded_extra.iter().cloned());
        callback::invoke_callback(a_callback, &forwarded, &vaults, cb_data, &callback_data)?;

        // Phase 3: repayment checks, commit, unlock.
        {
            let mut data = state::slab_data_mut(a_slab)?;
            let mut engine = state::read_engine(&data)?;
            for i in 0..n {
                let flow = &plan.flows[i];
                let post = token_account_amount(vaults[i])?;
                // Borrowed amounts must come back in full; provided amounts on
                // top of that. Rewards are gone for good.
                let required = pre_balances[i]
                    .checked_sub(flow.reward)
                    .and_then(|v| v.checked_add(flow.to_provide))
                    .ok_or(HubProgError::EngineOverflow)?;
                if post < required {
                    return Err(HubProgError::LiquidityNotReturned.into());
                }
                let surplus = post - required;
                engine
                    .credit_platform_surplus(&mints[i].key.to_bytes(), surplus as u128)
                    .map_err(map_hub_error)?;
                msg!(
                    "driphub: settle token {} provided {} reward {} fee {}",
                    mints[i].key,
                    flow.to_provide,
                    flow.reward,
                    flow.platform_fee
                );
            }
            engine.commit_settlement(&plan, now).map_err(map_hub_error)?;
            state::write_engine(&mut data, &engine)?;
            guard::release(&mut data);
        }
        Ok(())
    }

    fn process_flash_loan<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        amounts: Vec<u64>,
        callback_data: Vec<u8>,
    ) -> ProgramResult {
        let n = amounts.len();
        accounts::expect_len(accounts, 5 + 3 * n)?;
        let a_caller = &accounts[0];
        let a_slab = &accounts[1];
        let a_token = &accounts[2];
        let a_vault_pda = &accounts[3];
        let a_callback = &accounts[4];
        let per_token = &accounts[5..5 + 3 * n];
        let forwarded_extra = &accounts[5 + 3 * n..];

        accounts::expect_signer(a_caller)?;
        accounts::expect_writable(a_slab)?;

        let mints: Vec<&AccountInfo> = (0..n).map(|i| &per_token[3 * i]).collect();
        let vaults: Vec<&AccountInfo> = (0..n).map(|i| &per_token[3 * i + 1]).collect();
        let recipients: Vec<&AccountInfo> = (0..n).map(|i| &per_token[3 * i + 2]).collect();

        let (header, fees, loan_fee_rate) = {
            let mut data = state::slab_data_mut(a_slab)?;
            slab_guard(program_id, a_slab, &data)?;
            let header = require_initialized(&data)?;
            guard::acquire(&mut data)?;

            let engine = state::read_engine(&data)?;
            let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
            accounts::expect_key(a_vault_pda, &auth)?;

            let loans: Vec<(TokenId, u64)> = (0..n)
                .map(|i| (mints[i].key.to_bytes(), amounts[i]))
                .collect();
            let fees = engine.plan_flash_loan(&loans).map_err(map_hub_error)?;
            for i in 0..n {
                let meta = engine.token_meta(&loans[i].0).map_err(map_hub_error)?;
                verify_vault(
                    vaults[i],
                    &auth,
                    mints[i].key,
                    &Pubkey::new_from_array(meta.vault),
                )?;
            }
            (header, fees, engine.params.loan_fee)
        };

        let mut pre_balances = Vec::with_capacity(n);
        for vault in &vaults {
            pre_balances.push(token_account_amount(vault)?);
        }

        let bump = vault_signer_bump(&header);
        let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump];
        let mut cb_tokens = Vec::with_capacity(n);
        for i in 0..n {
            collateral::transfer_out(
                a_token, vaults[i], recipients[i], a_vault_pda, amounts[i], &[&seeds],
            )?;
            cb_tokens.push(callback::CallbackToken {
                mint: *mints[i].key,
                owed: amounts[i],
                extra: u64::try_from(fees[i]).map_err(|_| HubProgError::EngineOverflow)?,
            });
        }

        let cb_data = callback::encode(
            callback::LOAN_CALLBACK_TAG,
            a_caller.key,
            loan_fee_rate,
            &cb_tokens,
            &callback_data,
        );
        let mut forwarded: Vec<AccountInfo> = recipients.iter().map(|r| (*r).clone()).collect();
        forwarded.extend(forwarded_extra.iter().cloned());
        callback::invoke_callback(a_callback, &forwarded, &vaults, cb_data, &callback_data)?;

        {
            let mut data = state::slab_data_mut(a_slab)?;
            let mut engine = state::read_engine(&data)?;
            for i in 0..n {
                let post = token_account_amount(vaults[i])?;
                let fee = u64::try_from(fees[i]).map_err(|_| HubProgError::EngineOverflow)?;
                let required = pre_balances[i]
                    .checked_add(fee)
                    .ok_or(HubProgError::EngineOverflow)?;
                if post < required {
                    return Err(HubProgError::LiquidityNotReturned.into());
                }
                // Fee plus anything extra the borrower sent stays with the
                // platform, not the borrower.
                let net_gain = post - pre_balances[i];
                engine
                    .commit_flash_loan(&mints[i].key.to_bytes(), net_gain as u128)
                    .map_err(map_hub_error)?;
                msg!("driphub: loan token {} amount {} fee {}", mints[i].key, amounts[i], fee);
            }
            state::write_engine(&mut data, &engine)?;
            guard::release(&mut data);
        }
        Ok(())
    }
}

// 11. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };
    use crate::processor;

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }

    solana_security_txt::security_txt! {
        name: "driphub",
        project_url: "https://github.com/driphub/driphub",
        contacts: "email:security@driphub.xyz",
        policy: "https://github.com/driphub/driphub/blob/main/SECURITY.md",
        preferred_languages: "en"
    }
}

//! Lending client: account provisioning and operation orchestration against
//! the lending program.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use solana_program::pubkey::Pubkey;

    pub const LENDING_PROGRAM_ID: Pubkey =
        solana_program::pubkey!("FQwNs7BPQ9NW258VxGHo885VqPqHPk7yFZUFgDLJx9Hd");
    pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
        solana_program::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");
    pub const PYTH_PUSH_ORACLE_ID: Pubkey =
        solana_program::pubkey!("pythWSnswVUd12oZpeFP8e9CVaEqJg25g1Vtc2biRsT");

    /// Borrow falls back to this account when the price feed cannot be resolved.
    pub const ORACLE_FALLBACK: Pubkey =
        solana_program::pubkey!("7UVimffxr9ow1uXYxsr4LHAcV58mLzhmwaeKvJ1pjLiE");
    pub const SOL_USD_FEED_ID: &str =
        "0xeaa020c61cc479712813461ce153894a96a6c00b21ed0cfc2798d1f9a9e9c94a";

    pub const USDC_MINT: Pubkey =
        solana_program::pubkey!("U7UQ54N4ChCwJN1y112y99LV62qvGJgPGm687yhr1up");
    pub const SOL_MINT: Pubkey =
        solana_program::pubkey!("8zCxcaK8Cr21hJgUYLqa76UtZqNfAHV7ae3YD1Bdd5bH");
    pub const USDC_DECIMALS: u8 = 6;
    pub const SOL_DECIMALS: u8 = 9;

    pub const TREASURY_SEED: &[u8] = b"treasury";
    pub const DISCRIMINATOR_LEN: usize = 8;

    // Percentages applied when a bank is created lazily.
    pub const DEFAULT_LIQUIDATION_THRESHOLD: u64 = 80;
    pub const DEFAULT_MAX_LTV: u64 = 75;
}

// 2. mod error
pub mod error {
    use num_traits::FromPrimitive;
    use solana_program::{
        program_error::ProgramError, pubkey::Pubkey, system_instruction::SystemError,
        system_program,
    };
    use spl_token::error::TokenError;
    use thiserror::Error;
    use crate::{
        address::EntityKind,
        config::Cluster,
        rpc::{RpcError, SubmitError},
        state::LayoutError,
        wallet::{SignerError, WalletError},
    };

    #[derive(Debug, Error)]
    pub enum LendingError {
        #[error("invalid request: {0}")]
        Validation(String),
        #[error("malformed seeds for {kind}: {reason}")]
        MalformedSeeds { kind: EntityKind, reason: &'static str },
        #[error("failed to build instruction: {0}")]
        Instruction(#[from] ProgramError),
        #[error(transparent)]
        Wallet(#[from] WalletError),
        #[error(transparent)]
        Signer(#[from] SignerError),
        #[error(transparent)]
        Rpc(#[from] RpcError),
        #[error("account {address} exists but could not be decoded: {reason}")]
        Undecodable { address: Pubkey, reason: LayoutError },
        #[error(transparent)]
        Submission(#[from] SubmitError),
        #[error("{kind} {address} already exists")]
        AlreadyExists { kind: EntityKind, address: Pubkey },
        #[error("cancelled before {0}")]
        Cancelled(&'static str),
        #[error("operator credentials are not permitted on {0}")]
        OperatorForbidden(Cluster),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Shortfall {
        /// The signing operator lacks authority over the mint.
        Privilege,
        /// Not enough balance to pay fees or move the amount.
        Funds,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ErrorClass {
        BenignDuplicate,
        InsufficientResource(Shortfall),
        ValidationFailure,
        Unknown,
    }

    const DUPLICATE_MARKERS: &[&str] = &["already in use", "already exists"];
    const PRIVILEGE_MARKERS: &[&str] = &["mint authority", "owner does not match"];
    const FUNDS_MARKERS: &[&str] = &[
        "insufficient funds",
        "insufficient lamports",
        "no record of a prior credit",
    ];

    /// Decide how a failure is treated. Locally raised validation errors are
    /// settled by variant before any text matching, so a refusal can never
    /// read as a duplicate.
    pub fn classify(err: &LendingError) -> ErrorClass {
        let (message, logs): (String, &[String]) = match err {
            LendingError::AlreadyExists { .. } => return ErrorClass::BenignDuplicate,
            LendingError::Validation(_)
            | LendingError::MalformedSeeds { .. }
            | LendingError::Instruction(_)
            | LendingError::Wallet(_)
            | LendingError::Cancelled(_)
            | LendingError::OperatorForbidden(_) => return ErrorClass::ValidationFailure,
            LendingError::Signer(_) | LendingError::Undecodable { .. } => {
                return ErrorClass::Unknown
            }
            LendingError::Submission(e) => (e.message.to_lowercase(), e.logs.as_slice()),
            LendingError::Rpc(e) => (e.to_string().to_lowercase(), &[][..]),
        };

        let lowered: Vec<String> = logs.iter().map(|l| l.to_lowercase()).collect();
        let mentions = |markers: &[&str]| {
            markers
                .iter()
                .any(|m| message.contains(m) || lowered.iter().any(|l| l.contains(m)))
        };
        let failures: Vec<(Pubkey, u32)> = logs.iter().filter_map(|l| program_failure(l)).collect();
        let system_failed = |code: SystemError| {
            failures
                .iter()
                .any(|(p, c)| *p == system_program::id() && SystemError::from_u32(*c) == Some(code.clone()))
        };
        let token_failed = |code: TokenError| {
            failures
                .iter()
                .any(|(p, c)| *p == spl_token::id() && TokenError::from_u32(*c) == Some(code.clone()))
        };

        if mentions(DUPLICATE_MARKERS) || system_failed(SystemError::AccountAlreadyInUse) {
            return ErrorClass::BenignDuplicate;
        }
        if mentions(PRIVILEGE_MARKERS) || token_failed(TokenError::OwnerMismatch) {
            return ErrorClass::InsufficientResource(Shortfall::Privilege);
        }
        if mentions(FUNDS_MARKERS)
            || token_failed(TokenError::InsufficientFunds)
            || system_failed(SystemError::ResultWithNegativeLamports)
        {
            return ErrorClass::InsufficientResource(Shortfall::Funds);
        }
        ErrorClass::Unknown
    }

    /// Parses `Program <id> failed: custom program error: 0x<code>`.
    pub fn program_failure(line: &str) -> Option<(Pubkey, u32)> {
        let rest = line.trim().strip_prefix("Program ")?;
        let (program, code) = rest.split_once(" failed: custom program error: 0x")?;
        let program = program.parse().ok()?;
        let code = u32::from_str_radix(code.trim(), 16).ok()?;
        Some((program, code))
    }
}

// 3. mod address
pub mod address {
    use core::fmt;
    use solana_program::pubkey::{Pubkey, MAX_SEEDS, MAX_SEED_LEN};
    use crate::{
        constants::{ASSOCIATED_TOKEN_PROGRAM_ID, TREASURY_SEED},
        error::LendingError,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum EntityKind {
        Bank,
        Treasury,
        UserAccount,
        /// Associated token account of an owner for a mint.
        TokenHolding,
    }

    impl fmt::Display for EntityKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                EntityKind::Bank => "bank",
                EntityKind::Treasury => "treasury",
                EntityKind::UserAccount => "user account",
                EntityKind::TokenHolding => "token holding",
            })
        }
    }

    /// A bank and its treasury. Both are created by the same request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BankAddresses {
        pub bank: Pubkey,
        pub treasury: Pubkey,
    }

    impl BankAddresses {
        pub fn derive(program_id: &Pubkey, mint: &Pubkey) -> Result<Self, LendingError> {
            Ok(Self {
                bank: bank_address(program_id, mint)?,
                treasury: treasury_address(program_id, mint)?,
            })
        }
    }

    fn check_shape(kind: EntityKind, seeds: &[&[u8]]) -> Result<(), LendingError> {
        let malformed = |reason| Err(LendingError::MalformedSeeds { kind, reason });

        // The bump seed takes the last slot.
        if seeds.len() >= MAX_SEEDS {
            return malformed("too many seeds");
        }
        if seeds.iter().any(|s| s.len() > MAX_SEED_LEN) {
            return malformed("seed longer than 32 bytes");
        }
        match kind {
            EntityKind::Bank | EntityKind::UserAccount => {
                if seeds.len() != 1 || seeds[0].len() != 32 {
                    return malformed("expected a single 32-byte key");
                }
            }
            EntityKind::Treasury => {
                if seeds.len() != 2 || seeds[0] != TREASURY_SEED || seeds[1].len() != 32 {
                    return malformed("expected the treasury tag followed by a 32-byte key");
                }
            }
            EntityKind::TokenHolding => {
                if seeds.len() != 3 || seeds.iter().any(|s| s.len() != 32) {
                    return malformed("expected owner, token program and mint keys");
                }
            }
        }
        Ok(())
    }

    pub fn derive(program_id: &Pubkey, kind: EntityKind, seeds: &[&[u8]]) -> Result<Pubkey, LendingError> {
        check_shape(kind, seeds)?;
        let owner = match kind {
            EntityKind::TokenHolding => ASSOCIATED_TOKEN_PROGRAM_ID,
            _ => *program_id,
        };
        Pubkey::try_find_program_address(seeds, &owner)
            .map(|(address, _bump)| address)
            .ok_or(LendingError::MalformedSeeds { kind, reason: "no viable bump seed" })
    }

    pub fn bank_address(program_id: &Pubkey, mint: &Pubkey) -> Result<Pubkey, LendingError> {
        derive(program_id, EntityKind::Bank, &[mint.as_ref()])
    }

    pub fn treasury_address(program_id: &Pubkey, mint: &Pubkey) -> Result<Pubkey, LendingError> {
        derive(program_id, EntityKind::Treasury, &[TREASURY_SEED, mint.as_ref()])
    }

    pub fn user_address(program_id: &Pubkey, identity: &Pubkey) -> Result<Pubkey, LendingError> {
        derive(program_id, EntityKind::UserAccount, &[identity.as_ref()])
    }

    pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Result<Pubkey, LendingError> {
        let token_program = spl_token::id();
        derive(
            &ASSOCIATED_TOKEN_PROGRAM_ID,
            EntityKind::TokenHolding,
            &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        )
    }
}

// 4. mod ix
pub mod ix {
    use solana_program::{
        hash::hashv,
        instruction::{AccountMeta, Instruction},
        program_error::ProgramError,
        pubkey::Pubkey,
        system_program,
    };
    use crate::{
        address::BankAddresses,
        constants::{ASSOCIATED_TOKEN_PROGRAM_ID, DISCRIMINATOR_LEN},
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum LendingInstruction {
        InitBank { liquidation_threshold: u64, max_ltv: u64 },
        InitUser { usdc_address: Pubkey },
        Deposit { amount: u64 },
        Borrow { amount: u64 },
    }

    pub fn instruction_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
        let digest = hashv(&[b"global:".as_ref(), name.as_bytes()]);
        let mut out = [0u8; DISCRIMINATOR_LEN];
        out.copy_from_slice(&digest.to_bytes()[..DISCRIMINATOR_LEN]);
        out
    }

    impl LendingInstruction {
        pub fn name(&self) -> &'static str {
            match self {
                LendingInstruction::InitBank { .. } => "init_bank",
                LendingInstruction::InitUser { .. } => "init_user",
                LendingInstruction::Deposit { .. } => "deposit",
                LendingInstruction::Borrow { .. } => "borrow",
            }
        }

        pub fn encode(&self) -> Vec<u8> {
            let mut v = instruction_discriminator(self.name()).to_vec();
            match self {
                LendingInstruction::InitBank { liquidation_threshold, max_ltv } => {
                    v.extend_from_slice(&liquidation_threshold.to_le_bytes());
                    v.extend_from_slice(&max_ltv.to_le_bytes());
                }
                LendingInstruction::InitUser { usdc_address } => {
                    v.extend_from_slice(usdc_address.as_ref());
                }
                LendingInstruction::Deposit { amount } | LendingInstruction::Borrow { amount } => {
                    v.extend_from_slice(&amount.to_le_bytes());
                }
            }
            v
        }

        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            if input.len() < DISCRIMINATOR_LEN {
                return Err(ProgramError::InvalidInstructionData);
            }
            let (tag, mut rest) = input.split_at(DISCRIMINATOR_LEN);

            if tag == &instruction_discriminator("init_bank")[..] {
                let liquidation_threshold = read_u64(&mut rest)?;
                let max_ltv = read_u64(&mut rest)?;
                Ok(LendingInstruction::InitBank { liquidation_threshold, max_ltv })
            } else if tag == &instruction_discriminator("init_user")[..] {
                let usdc_address = read_pubkey(&mut rest)?;
                Ok(LendingInstruction::InitUser { usdc_address })
            } else if tag == &instruction_discriminator("deposit")[..] {
                let amount = read_u64(&mut rest)?;
                Ok(LendingInstruction::Deposit { amount })
            } else if tag == &instruction_discriminator("borrow")[..] {
                let amount = read_u64(&mut rest)?;
                Ok(LendingInstruction::Borrow { amount })
            } else {
                Err(ProgramError::InvalidInstructionData)
            }
        }
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        let bytes = <[u8; 8]>::try_from(bytes).map_err(|_| ProgramError::InvalidInstructionData)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        let bytes = <[u8; 32]>::try_from(bytes).map_err(|_| ProgramError::InvalidInstructionData)?;
        Ok(Pubkey::new_from_array(bytes))
    }

    pub fn init_bank(
        program_id: &Pubkey,
        signer: &Pubkey,
        mint: &Pubkey,
        bank: &BankAddresses,
        liquidation_threshold: u64,
        max_ltv: u64,
    ) -> Instruction {
        Instruction {
            program_id: *program_id,
            accounts: vec![
                AccountMeta::new(*signer, true),
                AccountMeta::new_readonly(*mint, false),
                AccountMeta::new(bank.bank, false),
                AccountMeta::new(bank.treasury, false),
                AccountMeta::new_readonly(spl_token::id(), false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: LendingInstruction::InitBank { liquidation_threshold, max_ltv }.encode(),
        }
    }

    pub fn init_user(
        program_id: &Pubkey,
        signer: &Pubkey,
        user_account: &Pubkey,
        usdc_address: &Pubkey,
    ) -> Instruction {
        Instruction {
            program_id: *program_id,
            accounts: vec![
                AccountMeta::new(*signer, true),
                AccountMeta::new(*user_account, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: LendingInstruction::InitUser { usdc_address: *usdc_address }.encode(),
        }
    }

    pub fn deposit(
        program_id: &Pubkey,
        signer: &Pubkey,
        mint: &Pubkey,
        bank: &BankAddresses,
        user_account: &Pubkey,
        user_token_account: &Pubkey,
        amount: u64,
    ) -> Instruction {
        let mut accounts = movement_accounts(signer, mint, bank, user_account, user_token_account);
        accounts.extend(program_accounts());
        Instruction {
            program_id: *program_id,
            accounts,
            data: LendingInstruction::Deposit { amount }.encode(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn borrow(
        program_id: &Pubkey,
        signer: &Pubkey,
        mint: &Pubkey,
        bank: &BankAddresses,
        user_account: &Pubkey,
        user_token_account: &Pubkey,
        price_update: &Pubkey,
        amount: u64,
    ) -> Instruction {
        let mut accounts = movement_accounts(signer, mint, bank, user_account, user_token_account);
        accounts.push(AccountMeta::new_readonly(*price_update, false));
        accounts.extend(program_accounts());
        Instruction {
            program_id: *program_id,
            accounts,
            data: LendingInstruction::Borrow { amount }.encode(),
        }
    }

    fn movement_accounts(
        signer: &Pubkey,
        mint: &Pubkey,
        bank: &BankAddresses,
        user_account: &Pubkey,
        user_token_account: &Pubkey,
    ) -> Vec<AccountMeta> {
        vec![
            AccountMeta::new(*signer, true),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new(bank.bank, false),
            AccountMeta::new(bank.treasury, false),
            AccountMeta::new(*user_account, false),
            AccountMeta::new(*user_token_account, false),
        ]
    }

    fn program_accounts() -> [AccountMeta; 3] {
        [
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ]
    }

    pub fn create_associated_token_account(
        payer: &Pubkey,
        holding: &Pubkey,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> Instruction {
        Instruction {
            program_id: ASSOCIATED_TOKEN_PROGRAM_ID,
            accounts: vec![
                AccountMeta::new(*payer, true),
                AccountMeta::new(*holding, false),
                AccountMeta::new_readonly(*owner, false),
                AccountMeta::new_readonly(*mint, false),
                AccountMeta::new_readonly(system_program::id(), false),
                AccountMeta::new_readonly(spl_token::id(), false),
            ],
            data: vec![],
        }
    }
}

// 5. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::mem::size_of;
    use solana_program::{hash::hashv, pubkey::Pubkey};
    use thiserror::Error;
    use crate::constants::DISCRIMINATOR_LEN;

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum LayoutError {
        #[error("owned by {0} instead of the lending program")]
        WrongOwner(Pubkey),
        #[error("expected at least {expected} bytes, found {found}")]
        TooShort { expected: usize, found: usize },
        #[error("discriminator does not match {0}")]
        Discriminator(&'static str),
    }

    pub trait LedgerAccount: Pod {
        const NAME: &'static str;

        fn discriminator() -> [u8; DISCRIMINATOR_LEN] {
            account_discriminator(Self::NAME)
        }
    }

    pub fn account_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
        let digest = hashv(&[b"account:".as_ref(), name.as_bytes()]);
        let mut out = [0u8; DISCRIMINATOR_LEN];
        out.copy_from_slice(&digest.to_bytes()[..DISCRIMINATOR_LEN]);
        out
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct BankState {
        pub authority: [u8; 32],
        pub mint_address: [u8; 32],
        pub total_deposits: u64,
        pub total_deposit_shares: u64,
        pub total_borrowed: u64,
        pub total_borrowed_shares: u64,
        pub liquidation_threshold: u64,
        pub liquidation_bonus: u64,
        pub liquidation_close_factor: u64,
        pub max_ltv: u64,
        pub last_updated: i64,
        pub interest_rate: u64,
    }

    impl BankState {
        pub fn authority(&self) -> Pubkey {
            Pubkey::new_from_array(self.authority)
        }

        pub fn mint(&self) -> Pubkey {
            Pubkey::new_from_array(self.mint_address)
        }
    }

    impl LedgerAccount for BankState {
        const NAME: &'static str = "Bank";
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct UserState {
        pub owner: [u8; 32],
        pub deposited_sol: u64,
        pub deposited_sol_shares: u64,
        pub borrowed_sol: u64,
        pub borrowed_sol_shares: u64,
        pub deposited_usdc: u64,
        pub deposited_usdc_shares: u64,
        pub borrowed_usdc: u64,
        pub borrowed_usdc_shares: u64,
        pub usdc_address: [u8; 32],
        pub health_factor: u64,
        pub last_updated: i64,
    }

    impl UserState {
        pub fn owner(&self) -> Pubkey {
            Pubkey::new_from_array(self.owner)
        }

        /// The asset the account was created against.
        pub fn usdc_address(&self) -> Pubkey {
            Pubkey::new_from_array(self.usdc_address)
        }
    }

    impl LedgerAccount for UserState {
        const NAME: &'static str = "User";
    }

    pub fn unpack<T: LedgerAccount>(data: &[u8]) -> Result<T, LayoutError> {
        let expected = DISCRIMINATOR_LEN + size_of::<T>();
        if data.len() < expected {
            return Err(LayoutError::TooShort { expected, found: data.len() });
        }
        if data[..DISCRIMINATOR_LEN] != T::discriminator() {
            return Err(LayoutError::Discriminator(T::NAME));
        }
        let mut value = T::zeroed();
        bytemuck::bytes_of_mut(&mut value).copy_from_slice(&data[DISCRIMINATOR_LEN..expected]);
        Ok(value)
    }

    pub fn pack<T: LedgerAccount>(value: &T) -> Vec<u8> {
        let mut data = T::discriminator().to_vec();
        data.extend_from_slice(bytemuck::bytes_of(value));
        data
    }
}

// 6. mod units
pub mod units {
    use crate::error::LendingError;

    /// Converts a decimal amount such as `"1.5"` into smallest units,
    /// truncating digits beyond `decimals`.
    pub fn to_base_units(amount: &str, decimals: u8) -> Result<u64, LendingError> {
        let invalid = || LendingError::Validation(format!("invalid amount {amount:?}"));
        let amount_str = amount.trim();
        let (whole, frac) = amount_str.split_once('.').unwrap_or((amount_str, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let scale = 10u64.checked_pow(decimals as u32).ok_or_else(invalid)?;
        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };

        let mut frac_value = 0u64;
        for i in 0..decimals as usize {
            let digit = frac.as_bytes().get(i).map_or(0, |b| (b - b'0') as u64);
            frac_value = frac_value * 10 + digit;
        }

        whole
            .checked_mul(scale)
            .and_then(|w| w.checked_add(frac_value))
            .ok_or_else(invalid)
    }

    pub fn format_base_units(amount: u64, decimals: u8) -> String {
        if decimals == 0 {
            return amount.to_string();
        }
        let Some(scale) = 10u64.checked_pow(decimals as u32) else {
            return amount.to_string();
        };
        format!("{}.{:0width$}", amount / scale, amount % scale, width = decimals as usize)
    }
}

// 7. mod config
pub mod config {
    use core::{fmt, str::FromStr};
    use serde::{Deserialize, Deserializer};
    use solana_program::pubkey::Pubkey;
    use std::path::Path;
    use thiserror::Error;
    use crate::constants::{
        DEFAULT_LIQUIDATION_THRESHOLD, DEFAULT_MAX_LTV, LENDING_PROGRAM_ID, ORACLE_FALLBACK,
        SOL_USD_FEED_ID,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Cluster {
        Localnet,
        Devnet,
        Testnet,
        #[serde(rename = "mainnet-beta")]
        Mainnet,
    }

    impl Cluster {
        pub fn is_production(&self) -> bool {
            matches!(self, Cluster::Mainnet)
        }
    }

    impl Default for Cluster {
        fn default() -> Self {
            Cluster::Devnet
        }
    }

    impl fmt::Display for Cluster {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Cluster::Localnet => "localnet",
                Cluster::Devnet => "devnet",
                Cluster::Testnet => "testnet",
                Cluster::Mainnet => "mainnet-beta",
            })
        }
    }

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("failed to read config: {0}")]
        Io(#[from] std::io::Error),
        #[error("failed to parse config: {0}")]
        Parse(#[from] toml::de::Error),
        #[error("invalid config: {0}")]
        Invalid(String),
    }

    #[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct RiskDefaults {
        pub liquidation_threshold: u64,
        pub max_ltv: u64,
    }

    impl Default for RiskDefaults {
        fn default() -> Self {
            Self {
                liquidation_threshold: DEFAULT_LIQUIDATION_THRESHOLD,
                max_ltv: DEFAULT_MAX_LTV,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct OracleConfig {
        pub feed_id: String,
        pub shard: u16,
        #[serde(deserialize_with = "pubkey_from_str")]
        pub fallback: Pubkey,
    }

    impl Default for OracleConfig {
        fn default() -> Self {
            Self {
                feed_id: SOL_USD_FEED_ID.to_string(),
                shard: 0,
                fallback: ORACLE_FALLBACK,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct ClientConfig {
        pub cluster: Cluster,
        #[serde(deserialize_with = "pubkey_from_str")]
        pub program_id: Pubkey,
        pub risk: RiskDefaults,
        pub oracle: OracleConfig,
    }

    impl Default for ClientConfig {
        fn default() -> Self {
            Self {
                cluster: Cluster::default(),
                program_id: LENDING_PROGRAM_ID,
                risk: RiskDefaults::default(),
                oracle: OracleConfig::default(),
            }
        }
    }

    impl ClientConfig {
        pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
            let config: ClientConfig = toml::from_str(input)?;
            config.validate()?;
            Ok(config)
        }

        pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
            let raw = std::fs::read_to_string(path)?;
            Self::from_toml_str(&raw)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            let RiskDefaults { liquidation_threshold, max_ltv } = self.risk;
            if !(1..=100).contains(&liquidation_threshold) || !(1..=100).contains(&max_ltv) {
                return Err(ConfigError::Invalid("risk percentages must lie in 1..=100".into()));
            }
            if max_ltv > liquidation_threshold {
                return Err(ConfigError::Invalid(format!(
                    "max_ltv {max_ltv} exceeds liquidation_threshold {liquidation_threshold}"
                )));
            }
            Ok(())
        }
    }

    fn pubkey_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

// 8. mod rpc
pub mod rpc {
    use async_trait::async_trait;
    use core::{fmt, str::FromStr};
    use solana_program::{hash::Hash, pubkey::Pubkey};
    use thiserror::Error;
    use crate::wallet::SignedRequest;

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signature([u8; 64]);

    impl Signature {
        pub const LEN: usize = 64;

        pub fn new(bytes: [u8; 64]) -> Self {
            Self(bytes)
        }

        pub fn as_bytes(&self) -> &[u8; 64] {
            &self.0
        }
    }

    impl fmt::Display for Signature {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&bs58::encode(self.0).into_string())
        }
    }

    impl fmt::Debug for Signature {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Signature({self})")
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    #[error("invalid signature encoding")]
    pub struct ParseSignatureError;

    impl FromStr for Signature {
        type Err = ParseSignatureError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let bytes = bs58::decode(s).into_vec().map_err(|_| ParseSignatureError)?;
            let bytes = <[u8; 64]>::try_from(bytes.as_slice()).map_err(|_| ParseSignatureError)?;
            Ok(Self(bytes))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RemoteAccount {
        pub owner: Pubkey,
        pub lamports: u64,
        pub data: Vec<u8>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum RpcError {
        #[error("rpc transport failure: {0}")]
        Transport(String),
        #[error("rpc returned an invalid response: {0}")]
        InvalidResponse(String),
    }

    /// A rejected submission with whatever program logs came back with it.
    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    #[error("{message}")]
    pub struct SubmitError {
        pub message: String,
        pub logs: Vec<String>,
    }

    impl SubmitError {
        pub fn new(message: impl Into<String>) -> Self {
            Self { message: message.into(), logs: Vec::new() }
        }

        pub fn with_logs(mut self, logs: Vec<String>) -> Self {
            self.logs = logs;
            self
        }
    }

    #[async_trait]
    pub trait LedgerRpc: Send + Sync {
        /// `Ok(None)` means the account does not exist.
        async fn get_account(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, RpcError>;

        /// All accounts of `program_id` whose data starts with `discriminator`.
        async fn get_program_accounts(
            &self,
            program_id: &Pubkey,
            discriminator: &[u8; 8],
        ) -> Result<Vec<(Pubkey, RemoteAccount)>, RpcError>;

        async fn latest_blockhash(&self) -> Result<Hash, RpcError>;

        async fn send_request(&self, request: &SignedRequest) -> Result<Signature, SubmitError>;
    }
}

// 9. mod wallet
pub mod wallet {
    use async_trait::async_trait;
    use core::fmt;
    use std::sync::Arc;
    use solana_program::{hash::Hash, instruction::Instruction, message::Message, pubkey::Pubkey};
    use thiserror::Error;
    use tracing::debug;
    use crate::{
        config::Cluster,
        error::LendingError,
        rpc::{LedgerRpc, Signature},
    };

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum WalletError {
        #[error("user rejected the request: {0}")]
        Rejected(String),
        #[error("wallet unavailable: {0}")]
        Unavailable(String),
    }

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    #[error("signing failed: {0}")]
    pub struct SignerError(pub String);

    /// The caller's wallet.
    #[async_trait]
    pub trait Wallet: Send + Sync {
        fn identity(&self) -> Pubkey;

        async fn sign_request(&self, request: &UnsignedRequest) -> Result<Signature, WalletError>;
    }

    /// A locally held key.
    pub trait Signer: Send + Sync {
        fn pubkey(&self) -> Pubkey;

        fn sign_message(&self, message: &[u8]) -> Result<Signature, SignerError>;
    }

    /// Privileged operator key, injected by the embedder. Refused on mainnet.
    #[derive(Clone)]
    pub struct OperatorCredential {
        signer: Arc<dyn Signer>,
        cluster: Cluster,
    }

    impl OperatorCredential {
        pub fn new(signer: Arc<dyn Signer>, cluster: Cluster) -> Result<Self, LendingError> {
            if cluster.is_production() {
                return Err(LendingError::OperatorForbidden(cluster));
            }
            Ok(Self { signer, cluster })
        }

        pub fn pubkey(&self) -> Pubkey {
            self.signer.pubkey()
        }

        pub fn cluster(&self) -> Cluster {
            self.cluster
        }

        pub fn sign(&self, request: &UnsignedRequest) -> Result<Signature, SignerError> {
            self.signer.sign_message(&request.message_bytes())
        }
    }

    impl fmt::Debug for OperatorCredential {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("OperatorCredential")
                .field("pubkey", &self.pubkey())
                .field("cluster", &self.cluster)
                .finish()
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct UnsignedRequest {
        payer: Pubkey,
        message: Message,
    }

    impl UnsignedRequest {
        pub fn new(instructions: &[Instruction], payer: &Pubkey, recent_blockhash: Hash) -> Result<Self, LendingError> {
            if instructions.is_empty() {
                return Err(LendingError::Validation("request carries no instructions".into()));
            }
            Ok(Self {
                payer: *payer,
                message: Message::new_with_blockhash(instructions, Some(payer), &recent_blockhash),
            })
        }

        pub fn payer(&self) -> Pubkey {
            self.payer
        }

        pub fn message(&self) -> &Message {
            &self.message
        }

        pub fn message_bytes(&self) -> Vec<u8> {
            self.message.serialize()
        }

        /// Required signers in message order; the fee payer comes first.
        pub fn signers(&self) -> &[Pubkey] {
            let n = (self.message.header.num_required_signatures as usize).min(self.message.account_keys.len());
            &self.message.account_keys[..n]
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SignedRequest {
        message: Message,
        signatures: Vec<Signature>,
    }

    impl SignedRequest {
        /// Orders `provided` by the request's signer list. Every required
        /// signer must be covered and no stranger may sign.
        pub fn assemble(request: UnsignedRequest, provided: Vec<(Pubkey, Signature)>) -> Result<Self, LendingError> {
            let signers = request.signers();
            if let Some((stranger, _)) = provided.iter().find(|(key, _)| !signers.contains(key)) {
                return Err(LendingError::Validation(format!("{stranger} is not a required signer")));
            }
            let signatures = signers
                .iter()
                .map(|key| {
                    provided
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, sig)| *sig)
                        .ok_or_else(|| LendingError::Validation(format!("missing signature for {key}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self { message: request.message, signatures })
        }

        pub fn message(&self) -> &Message {
            &self.message
        }

        pub fn signatures(&self) -> &[Signature] {
            &self.signatures
        }

        pub fn signers(&self) -> &[Pubkey] {
            &self.message.account_keys[..self.signatures.len()]
        }
    }

    /// Builds and signs one request without sending it. Co-signers sign
    /// before the wallet, which pays fees.
    pub async fn sign(
        rpc: &dyn LedgerRpc,
        wallet: &dyn Wallet,
        instructions: &[Instruction],
        co_signers: &[&OperatorCredential],
    ) -> Result<SignedRequest, LendingError> {
        let payer = wallet.identity();
        let blockhash = rpc.latest_blockhash().await?;
        let request = UnsignedRequest::new(instructions, &payer, blockhash)?;

        let mut signatures = Vec::with_capacity(co_signers.len() + 1);
        for co_signer in co_signers {
            signatures.push((co_signer.pubkey(), co_signer.sign(&request)?));
        }
        signatures.push((payer, wallet.sign_request(&request).await?));

        SignedRequest::assemble(request, signatures)
    }

    pub async fn send(rpc: &dyn LedgerRpc, signed: &SignedRequest) -> Result<Signature, LendingError> {
        debug!(
            instructions = signed.message().instructions.len(),
            signers = signed.signatures().len(),
            "submitting request"
        );
        Ok(rpc.send_request(signed).await?)
    }

    pub async fn sign_and_send(
        rpc: &dyn LedgerRpc,
        wallet: &dyn Wallet,
        instructions: &[Instruction],
        co_signers: &[&OperatorCredential],
    ) -> Result<Signature, LendingError> {
        let signed = sign(rpc, wallet, instructions, co_signers).await?;
        send(rpc, &signed).await
    }
}

// 10. mod probe
pub mod probe {
    use solana_program::pubkey::Pubkey;
    use crate::{
        error::LendingError,
        rpc::{LedgerRpc, RemoteAccount},
        state::{self, LayoutError, LedgerAccount},
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Probe<T> {
        Present(T),
        Absent,
    }

    impl<T> Probe<T> {
        pub fn is_present(&self) -> bool {
            matches!(self, Probe::Present(_))
        }

        pub fn present(self) -> Option<T> {
            match self {
                Probe::Present(value) => Some(value),
                Probe::Absent => None,
            }
        }
    }

    /// Fetches and decodes `address`. A missing account is `Absent`; an
    /// account that exists but does not decode is an error.
    pub async fn probe<T: LedgerAccount>(
        rpc: &dyn LedgerRpc,
        program_id: &Pubkey,
        address: &Pubkey,
    ) -> Result<Probe<T>, LendingError> {
        match rpc.get_account(address).await? {
            None => Ok(Probe::Absent),
            Some(account) => decode(program_id, address, &account).map(Probe::Present),
        }
    }

    pub fn decode<T: LedgerAccount>(
        program_id: &Pubkey,
        address: &Pubkey,
        account: &RemoteAccount,
    ) -> Result<T, LendingError> {
        let undecodable = |reason| LendingError::Undecodable { address: *address, reason };
        if account.owner != *program_id {
            return Err(undecodable(LayoutError::WrongOwner(account.owner)));
        }
        state::unpack(&account.data).map_err(undecodable)
    }

    /// Raw existence check for accounts this client never decodes.
    pub async fn exists(rpc: &dyn LedgerRpc, address: &Pubkey) -> Result<bool, LendingError> {
        Ok(rpc.get_account(address).await?.is_some())
    }
}

// 11. mod oracle
pub mod oracle {
    use async_trait::async_trait;
    use pyth_sdk_solana::PriceIdentifier;
    use solana_program::pubkey::Pubkey;
    use thiserror::Error;
    use tracing::warn;
    use crate::constants::PYTH_PUSH_ORACLE_ID;

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum OracleError {
        #[error("invalid price feed id {feed_id}: {reason}")]
        InvalidFeed { feed_id: String, reason: String },
        #[error("price feed unavailable: {0}")]
        Unavailable(String),
    }

    #[async_trait]
    pub trait PriceOracle: Send + Sync {
        async fn price_account(&self, feed_id: &str) -> Result<Pubkey, OracleError>;
    }

    pub fn parse_feed_id(feed_id: &str) -> Result<PriceIdentifier, OracleError> {
        let hex = feed_id.trim();
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        PriceIdentifier::from_hex(hex).map_err(|e| OracleError::InvalidFeed {
            feed_id: feed_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolves feeds to Pyth push-oracle price accounts.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PythPushOracle {
        shard: u16,
    }

    impl PythPushOracle {
        pub fn new(shard: u16) -> Self {
            Self { shard }
        }

        pub fn feed_address(&self, feed: &PriceIdentifier) -> Pubkey {
            let shard = self.shard.to_le_bytes();
            let feed = feed.to_bytes();
            Pubkey::find_program_address(&[shard.as_ref(), feed.as_ref()], &PYTH_PUSH_ORACLE_ID).0
        }
    }

    #[async_trait]
    impl PriceOracle for PythPushOracle {
        async fn price_account(&self, feed_id: &str) -> Result<Pubkey, OracleError> {
            Ok(self.feed_address(&parse_feed_id(feed_id)?))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OracleResolution {
        pub address: Pubkey,
        pub fallback: bool,
    }

    /// Never fails: an oracle error yields the placeholder account. Price
    /// checks on the program side then run against that placeholder, so
    /// every fallback is logged and reported to the caller.
    pub async fn resolve_or_fallback(oracle: &dyn PriceOracle, feed_id: &str, fallback: &Pubkey) -> OracleResolution {
        match oracle.price_account(feed_id).await {
            Ok(address) => OracleResolution { address, fallback: false },
            Err(err) => {
                warn!(error = %err, %fallback, "price feed resolution failed, using placeholder account");
                OracleResolution { address: *fallback, fallback: true }
            }
        }
    }
}

// 12. mod cache
pub mod cache {
    use async_trait::async_trait;
    use solana_program::pubkey::Pubkey;
    use std::collections::HashMap;
    use tokio::sync::RwLock;
    use tracing::debug;
    use crate::{
        config::Cluster,
        state::{BankState, UserState},
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum QueryScope {
        Banks,
        Users,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum QueryKind {
        BankList,
        UserList,
        Bank(Pubkey),
        User(Pubkey),
    }

    impl QueryKind {
        pub fn scope(&self) -> QueryScope {
            match self {
                QueryKind::BankList | QueryKind::Bank(_) => QueryScope::Banks,
                QueryKind::UserList | QueryKind::User(_) => QueryScope::Users,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueryKey {
        pub cluster: Cluster,
        pub kind: QueryKind,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum QueryValue {
        BankList(Vec<(Pubkey, BankState)>),
        UserList(Vec<(Pubkey, UserState)>),
        Bank(BankState),
        User(UserState),
    }

    /// Advisory read cache. Entries live until invalidated; readers may see
    /// stale data between a mutation and its invalidation.
    #[async_trait]
    pub trait QueryCache: Send + Sync {
        async fn get(&self, key: &QueryKey) -> Option<QueryValue>;

        async fn put(&self, key: QueryKey, value: QueryValue);

        async fn invalidate(&self, cluster: Cluster, scope: QueryScope);
    }

    #[derive(Debug, Default)]
    pub struct MemoryCache {
        entries: RwLock<HashMap<QueryKey, QueryValue>>,
    }

    impl MemoryCache {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn len(&self) -> usize {
            self.entries.read().await.len()
        }

        pub async fn is_empty(&self) -> bool {
            self.entries.read().await.is_empty()
        }
    }

    #[async_trait]
    impl QueryCache for MemoryCache {
        async fn get(&self, key: &QueryKey) -> Option<QueryValue> {
            self.entries.read().await.get(key).cloned()
        }

        async fn put(&self, key: QueryKey, value: QueryValue) {
            self.entries.write().await.insert(key, value);
        }

        async fn invalidate(&self, cluster: Cluster, scope: QueryScope) {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|key, _| !(key.cluster == cluster && key.kind.scope() == scope));
            debug!(%cluster, ?scope, dropped = before - entries.len(), "cache invalidated");
        }
    }
}

// 13. mod provisioner
pub mod provisioner {
    use solana_program::pubkey::Pubkey;
    use tracing::{debug, info};
    use crate::{
        address::{self, BankAddresses, EntityKind},
        error::{classify, ErrorClass, LendingError},
        ix,
        probe,
        rpc::{LedgerRpc, Signature},
        state::{BankState, UserState},
        wallet::{self, Wallet},
    };

    /// Entities that can be created on demand. The treasury has no variant:
    /// it only comes into being through its bank's initialize request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Entity {
        Bank { mint: Pubkey, liquidation_threshold: u64, max_ltv: u64 },
        User { usdc_address: Pubkey },
    }

    impl Entity {
        pub fn kind(&self) -> EntityKind {
            match self {
                Entity::Bank { .. } => EntityKind::Bank,
                Entity::User { .. } => EntityKind::UserAccount,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ProvisionOutcome {
        AlreadyPresent,
        Created(Signature),
        /// Our create lost a race; the account exists all the same.
        CreatedConcurrently,
    }

    impl ProvisionOutcome {
        pub fn created(&self) -> bool {
            matches!(self, ProvisionOutcome::Created(_))
        }
    }

    pub struct Provisioner<'a> {
        program_id: Pubkey,
        rpc: &'a dyn LedgerRpc,
        wallet: &'a dyn Wallet,
    }

    impl<'a> Provisioner<'a> {
        pub fn new(program_id: Pubkey, rpc: &'a dyn LedgerRpc, wallet: &'a dyn Wallet) -> Self {
            Self { program_id, rpc, wallet }
        }

        /// Makes sure `entity` exists. Safe to call from any number of
        /// clients at once: the ledger accepts one create per address and
        /// the rest come back as `CreatedConcurrently`.
        pub async fn ensure(&self, entity: &Entity) -> Result<ProvisionOutcome, LendingError> {
            let kind = entity.kind();
            let signer = self.wallet.identity();

            let (address, present) = match *entity {
                Entity::Bank { mint, .. } => {
                    let bank = address::bank_address(&self.program_id, &mint)?;
                    (bank, probe::probe::<BankState>(self.rpc, &self.program_id, &bank).await?.is_present())
                }
                Entity::User { .. } => {
                    let user = address::user_address(&self.program_id, &signer)?;
                    (user, probe::probe::<UserState>(self.rpc, &self.program_id, &user).await?.is_present())
                }
            };
            if present {
                debug!(%kind, %address, "already provisioned");
                return Ok(ProvisionOutcome::AlreadyPresent);
            }

            let create = match *entity {
                Entity::Bank { mint, liquidation_threshold, max_ltv } => {
                    let bank = BankAddresses::derive(&self.program_id, &mint)?;
                    ix::init_bank(&self.program_id, &signer, &mint, &bank, liquidation_threshold, max_ltv)
                }
                Entity::User { usdc_address } => {
                    ix::init_user(&self.program_id, &signer, &address, &usdc_address)
                }
            };

            info!(%kind, %address, "creating missing account");
            match wallet::sign_and_send(self.rpc, self.wallet, &[create], &[]).await {
                Ok(signature) => {
                    info!(%kind, %address, %signature, "account created");
                    Ok(ProvisionOutcome::Created(signature))
                }
                Err(err) if classify(&err) == ErrorClass::BenignDuplicate => {
                    info!(%kind, %address, "account created by a concurrent client, continuing");
                    Ok(ProvisionOutcome::CreatedConcurrently)
                }
                Err(err) => Err(err),
            }
        }
    }
}

// 14. mod orchestrator
pub mod orchestrator {
    use core::fmt;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use solana_program::pubkey::Pubkey;
    use thiserror::Error;
    use tracing::{debug, info, warn};
    use crate::{
        address::{self, BankAddresses, EntityKind},
        cache::{QueryCache, QueryKey, QueryKind, QueryScope, QueryValue},
        config::ClientConfig,
        error::{classify, ErrorClass, LendingError, Shortfall},
        ix,
        oracle::{self, PriceOracle},
        probe::{self, Probe},
        provisioner::{Entity, Provisioner},
        rpc::{LedgerRpc, Signature},
        state::{BankState, LedgerAccount, UserState},
        wallet::{self, Wallet},
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Stage {
        Start,
        BankEnsured,
        UserEnsured,
        PrimarySubmitted,
        Succeeded,
    }

    impl fmt::Display for Stage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Stage::Start => "start",
                Stage::BankEnsured => "bank ensured",
                Stage::UserEnsured => "user ensured",
                Stage::PrimarySubmitted => "primary submitted",
                Stage::Succeeded => "succeeded",
            })
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum OperationKind {
        Deposit,
        Borrow,
        InitializeBank,
        InitializeUser,
        MintTokens,
    }

    impl fmt::Display for OperationKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                OperationKind::Deposit => "deposit",
                OperationKind::Borrow => "borrow",
                OperationKind::InitializeBank => "initialize bank",
                OperationKind::InitializeUser => "initialize user",
                OperationKind::MintTokens => "mint tokens",
            })
        }
    }

    #[derive(Debug, Error)]
    #[error("{operation} failed at {stage}: {source}")]
    pub struct OperationError {
        pub operation: OperationKind,
        /// Last stage reached before the failure.
        pub stage: Stage,
        pub class: ErrorClass,
        #[source]
        pub source: LendingError,
    }

    impl OperationError {
        pub fn new(operation: OperationKind, stage: Stage, source: LendingError) -> Self {
            let class = classify(&source);
            Self { operation, stage, class, source }
        }

        /// The goal was already met by someone else. Reported, not a success.
        /// A faucet request that collides on a holding minted nothing, so it
        /// never qualifies.
        pub fn is_informational(&self) -> bool {
            self.class == ErrorClass::BenignDuplicate && self.operation != OperationKind::MintTokens
        }

        pub fn user_message(&self) -> String {
            match self.class {
                ErrorClass::BenignDuplicate if self.is_informational() => match self.operation {
                    OperationKind::InitializeUser => "User account already exists".to_string(),
                    OperationKind::InitializeBank => "Bank already exists for this mint".to_string(),
                    _ => "Account already exists".to_string(),
                },
                ErrorClass::InsufficientResource(Shortfall::Privilege) => {
                    "Admin wallet does not have mint authority for this token".to_string()
                }
                ErrorClass::InsufficientResource(Shortfall::Funds) => {
                    "Insufficient SOL for transaction fees".to_string()
                }
                ErrorClass::BenignDuplicate | ErrorClass::ValidationFailure | ErrorClass::Unknown => {
                    format!("Failed to {}: {}", self.operation, self.source)
                }
            }
        }
    }

    /// Wraps and logs a failure. Program logs are kept at debug level.
    pub(crate) fn raise(operation: OperationKind, stage: Stage, source: LendingError) -> OperationError {
        let error = OperationError::new(operation, stage, source);
        if let LendingError::Submission(submit) = &error.source {
            for line in &submit.logs {
                debug!(%operation, "program log: {line}");
            }
        }
        if error.is_informational() {
            info!(%operation, %stage, "{}", error.user_message());
        } else {
            warn!(%operation, %stage, class = ?error.class, error = %error.source, "operation failed");
        }
        error
    }

    /// Stops steps that have not been submitted yet. Accepted effects stay.
    #[derive(Clone, Debug, Default)]
    pub struct CancelToken(Arc<AtomicBool>);

    impl CancelToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn checkpoint(&self, step: &'static str) -> Result<(), LendingError> {
            if self.is_cancelled() {
                return Err(LendingError::Cancelled(step));
            }
            Ok(())
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum PrimaryOperation {
        Deposit { mint: Pubkey, amount: u64 },
        Borrow { mint: Pubkey, amount: u64 },
    }

    impl PrimaryOperation {
        pub fn kind(&self) -> OperationKind {
            match self {
                PrimaryOperation::Deposit { .. } => OperationKind::Deposit,
                PrimaryOperation::Borrow { .. } => OperationKind::Borrow,
            }
        }

        pub fn mint(&self) -> Pubkey {
            match *self {
                PrimaryOperation::Deposit { mint, .. } | PrimaryOperation::Borrow { mint, .. } => mint,
            }
        }

        pub fn amount(&self) -> u64 {
            match *self {
                PrimaryOperation::Deposit { amount, .. } | PrimaryOperation::Borrow { amount, .. } => amount,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct OperationReceipt {
        pub signature: Signature,
        /// Entities this call created itself, in creation order.
        pub created: Vec<EntityKind>,
        /// Borrow ran against the placeholder price account.
        pub oracle_fallback: bool,
    }

    pub struct OperationOrchestrator {
        config: ClientConfig,
        rpc: Arc<dyn LedgerRpc>,
        wallet: Arc<dyn Wallet>,
        oracle: Arc<dyn PriceOracle>,
        cache: Arc<dyn QueryCache>,
    }

    impl OperationOrchestrator {
        pub fn new(
            config: ClientConfig,
            rpc: Arc<dyn LedgerRpc>,
            wallet: Arc<dyn Wallet>,
            oracle: Arc<dyn PriceOracle>,
            cache: Arc<dyn QueryCache>,
        ) -> Self {
            Self { config, rpc, wallet, oracle, cache }
        }

        pub fn config(&self) -> &ClientConfig {
            &self.config
        }

        pub fn identity(&self) -> Pubkey {
            self.wallet.identity()
        }

        pub fn provisioner(&self) -> Provisioner<'_> {
            Provisioner::new(self.config.program_id, self.rpc.as_ref(), self.wallet.as_ref())
        }

        pub async fn deposit(&self, mint: Pubkey, amount: u64) -> Result<OperationReceipt, OperationError> {
            self.execute(PrimaryOperation::Deposit { mint, amount }, &CancelToken::default()).await
        }

        pub async fn borrow(&self, mint: Pubkey, amount: u64) -> Result<OperationReceipt, OperationError> {
            self.execute(PrimaryOperation::Borrow { mint, amount }, &CancelToken::default()).await
        }

        /// Start -> BankEnsured -> UserEnsured -> PrimarySubmitted -> Succeeded.
        /// Any failure stops the walk; nothing already accepted is undone.
        pub async fn execute(
            &self,
            operation: PrimaryOperation,
            cancel: &CancelToken,
        ) -> Result<OperationReceipt, OperationError> {
            let mut stage = Stage::Start;
            let result = self.run_primary(operation, cancel, &mut stage).await;
            result.map_err(|err| raise(operation.kind(), stage, err))
        }

        async fn run_primary(
            &self,
            operation: PrimaryOperation,
            cancel: &CancelToken,
            stage: &mut Stage,
        ) -> Result<OperationReceipt, LendingError> {
            let mint = operation.mint();
            let amount = operation.amount();
            if amount == 0 {
                return Err(LendingError::Validation(format!("{} amount must be positive", operation.kind())));
            }

            let program_id = self.config.program_id;
            let signer = self.wallet.identity();
            let bank = BankAddresses::derive(&program_id, &mint)?;
            let user_account = address::user_address(&program_id, &signer)?;
            let user_token_account = address::associated_token_address(&signer, &mint)?;
            let provisioner = self.provisioner();
            let mut created = Vec::new();

            cancel.checkpoint("bank provisioning")?;
            let outcome = provisioner
                .ensure(&Entity::Bank {
                    mint,
                    liquidation_threshold: self.config.risk.liquidation_threshold,
                    max_ltv: self.config.risk.max_ltv,
                })
                .await?;
            if outcome.created() {
                created.push(EntityKind::Bank);
            }
            *stage = Stage::BankEnsured;
            debug!(%mint, ?outcome, "bank ensured");

            cancel.checkpoint("user provisioning")?;
            // A lazily created user account takes the operation's mint as its reference asset.
            let outcome = provisioner.ensure(&Entity::User { usdc_address: mint }).await?;
            if outcome.created() {
                created.push(EntityKind::UserAccount);
            }
            *stage = Stage::UserEnsured;
            debug!(%user_account, ?outcome, "user ensured");

            cancel.checkpoint("primary submission")?;
            let (instruction, oracle_fallback) = match operation {
                PrimaryOperation::Deposit { .. } => (
                    ix::deposit(&program_id, &signer, &mint, &bank, &user_account, &user_token_account, amount),
                    false,
                ),
                PrimaryOperation::Borrow { .. } => {
                    let price = oracle::resolve_or_fallback(
                        self.oracle.as_ref(),
                        &self.config.oracle.feed_id,
                        &self.config.oracle.fallback,
                    )
                    .await;
                    (
                        ix::borrow(
                            &program_id,
                            &signer,
                            &mint,
                            &bank,
                            &user_account,
                            &user_token_account,
                            &price.address,
                            amount,
                        ),
                        price.fallback,
                    )
                }
            };

            // The oracle lookup can outlast a cancel.
            cancel.checkpoint("primary submission")?;
            let signed = wallet::sign(self.rpc.as_ref(), self.wallet.as_ref(), &[instruction], &[]).await?;
            *stage = Stage::PrimarySubmitted;
            let signature = wallet::send(self.rpc.as_ref(), &signed).await?;
            *stage = Stage::Succeeded;
            info!(operation = %operation.kind(), %mint, amount, %signature, "operation accepted");

            self.invalidate(&[QueryScope::Banks, QueryScope::Users]).await;
            Ok(OperationReceipt { signature, created, oracle_fallback })
        }

        pub async fn initialize_bank(
            &self,
            mint: Pubkey,
            liquidation_threshold: u64,
            max_ltv: u64,
        ) -> Result<OperationReceipt, OperationError> {
            let mut stage = Stage::Start;
            let result = self.run_initialize_bank(mint, liquidation_threshold, max_ltv, &mut stage).await;
            result.map_err(|err| raise(OperationKind::InitializeBank, stage, err))
        }

        async fn run_initialize_bank(
            &self,
            mint: Pubkey,
            liquidation_threshold: u64,
            max_ltv: u64,
            stage: &mut Stage,
        ) -> Result<OperationReceipt, LendingError> {
            let program_id = self.config.program_id;
            let bank = BankAddresses::derive(&program_id, &mint)?;
            let instruction =
                ix::init_bank(&program_id, &self.wallet.identity(), &mint, &bank, liquidation_threshold, max_ltv);

            let signed = wallet::sign(self.rpc.as_ref(), self.wallet.as_ref(), &[instruction], &[]).await?;
            *stage = Stage::PrimarySubmitted;
            let signature = wallet::send(self.rpc.as_ref(), &signed).await?;
            *stage = Stage::Succeeded;
            info!(%mint, bank = %bank.bank, %signature, "bank initialized");

            self.invalidate(&[QueryScope::Banks]).await;
            Ok(OperationReceipt { signature, created: vec![EntityKind::Bank], oracle_fallback: false })
        }

        /// Explicit creation. An existing account is reported as a duplicate
        /// without submitting anything.
        pub async fn initialize_user(&self, usdc_address: Pubkey) -> Result<OperationReceipt, OperationError> {
            let mut stage = Stage::Start;
            let result = self.run_initialize_user(usdc_address, &mut stage).await;
            result.map_err(|err| raise(OperationKind::InitializeUser, stage, err))
        }

        async fn run_initialize_user(&self, usdc_address: Pubkey, stage: &mut Stage) -> Result<OperationReceipt, LendingError> {
            let program_id = self.config.program_id;
            let signer = self.wallet.identity();
            let user_account = address::user_address(&program_id, &signer)?;

            if probe::probe::<UserState>(self.rpc.as_ref(), &program_id, &user_account).await?.is_present() {
                return Err(LendingError::AlreadyExists { kind: EntityKind::UserAccount, address: user_account });
            }

            let instruction = ix::init_user(&program_id, &signer, &user_account, &usdc_address);
            let signed = wallet::sign(self.rpc.as_ref(), self.wallet.as_ref(), &[instruction], &[]).await?;
            *stage = Stage::PrimarySubmitted;
            let signature = wallet::send(self.rpc.as_ref(), &signed).await?;
            *stage = Stage::Succeeded;
            info!(%user_account, %signature, "user account initialized");

            self.invalidate(&[QueryScope::Users]).await;
            Ok(OperationReceipt { signature, created: vec![EntityKind::UserAccount], oracle_fallback: false })
        }

        async fn invalidate(&self, scopes: &[QueryScope]) {
            for scope in scopes {
                self.cache.invalidate(self.config.cluster, *scope).await;
            }
        }

        fn key(&self, kind: QueryKind) -> QueryKey {
            QueryKey { cluster: self.config.cluster, kind }
        }

        async fn scan<T: LedgerAccount>(&self) -> Result<Vec<(Pubkey, T)>, LendingError> {
            let program_id = self.config.program_id;
            let accounts = self.rpc.get_program_accounts(&program_id, &T::discriminator()).await?;
            accounts
                .iter()
                .map(|(address, account)| probe::decode::<T>(&program_id, address, account).map(|s| (*address, s)))
                .collect()
        }

        pub async fn banks(&self) -> Result<Vec<(Pubkey, BankState)>, LendingError> {
            let key = self.key(QueryKind::BankList);
            if let Some(QueryValue::BankList(banks)) = self.cache.get(&key).await {
                return Ok(banks);
            }
            let banks = self.scan::<BankState>().await?;
            self.cache.put(key, QueryValue::BankList(banks.clone())).await;
            Ok(banks)
        }

        pub async fn users(&self) -> Result<Vec<(Pubkey, UserState)>, LendingError> {
            let key = self.key(QueryKind::UserList);
            if let Some(QueryValue::UserList(users)) = self.cache.get(&key).await {
                return Ok(users);
            }
            let users = self.scan::<UserState>().await?;
            self.cache.put(key, QueryValue::UserList(users.clone())).await;
            Ok(users)
        }

        pub async fn bank(&self, address: &Pubkey) -> Result<Probe<BankState>, LendingError> {
            let key = self.key(QueryKind::Bank(*address));
            if let Some(QueryValue::Bank(bank)) = self.cache.get(&key).await {
                return Ok(Probe::Present(bank));
            }
            let found = probe::probe::<BankState>(self.rpc.as_ref(), &self.config.program_id, address).await?;
            if let Probe::Present(bank) = found {
                self.cache.put(key, QueryValue::Bank(bank)).await;
            }
            Ok(found)
        }

        pub async fn bank_for_mint(&self, mint: &Pubkey) -> Result<Probe<BankState>, LendingError> {
            let address = address::bank_address(&self.config.program_id, mint)?;
            self.bank(&address).await
        }

        pub async fn user(&self, address: &Pubkey) -> Result<Probe<UserState>, LendingError> {
            let key = self.key(QueryKind::User(*address));
            if let Some(QueryValue::User(user)) = self.cache.get(&key).await {
                return Ok(Probe::Present(user));
            }
            let found = probe::probe::<UserState>(self.rpc.as_ref(), &self.config.program_id, address).await?;
            if let Probe::Present(user) = found {
                self.cache.put(key, QueryValue::User(user)).await;
            }
            Ok(found)
        }

        /// The connected wallet's own user account.
        pub async fn user_account(&self) -> Result<Probe<UserState>, LendingError> {
            let address = address::user_address(&self.config.program_id, &self.wallet.identity())?;
            self.user(&address).await
        }
    }
}

// 15. mod faucet
pub mod faucet {
    use std::sync::Arc;
    use solana_program::{instruction::Instruction, pubkey::Pubkey};
    use tracing::info;
    use crate::{
        address,
        error::LendingError,
        ix,
        orchestrator::{raise, OperationError, OperationKind, Stage},
        probe,
        rpc::{LedgerRpc, Signature},
        wallet::{self, OperatorCredential, Wallet},
    };

    /// Test-network token faucet: the operator mints into its own holding
    /// and transfers to the caller, all in one request.
    pub struct ManualTokenFaucet {
        rpc: Arc<dyn LedgerRpc>,
        wallet: Arc<dyn Wallet>,
        operator: OperatorCredential,
    }

    impl ManualTokenFaucet {
        pub fn new(rpc: Arc<dyn LedgerRpc>, wallet: Arc<dyn Wallet>, operator: OperatorCredential) -> Self {
            Self { rpc, wallet, operator }
        }

        pub fn operator(&self) -> Pubkey {
            self.operator.pubkey()
        }

        pub async fn mint_tokens(&self, mint: &Pubkey, amount: u64) -> Result<Signature, OperationError> {
            let mut stage = Stage::Start;
            let result = self.run(mint, amount, &mut stage).await;
            result.map_err(|err| raise(OperationKind::MintTokens, stage, err))
        }

        async fn run(&self, mint: &Pubkey, amount: u64, stage: &mut Stage) -> Result<Signature, LendingError> {
            if amount == 0 {
                return Err(LendingError::Validation("mint amount must be positive".into()));
            }
            let instructions = self.build_instructions(mint, amount).await?;

            let signed =
                wallet::sign(self.rpc.as_ref(), self.wallet.as_ref(), &instructions, &[&self.operator]).await?;
            *stage = Stage::PrimarySubmitted;
            let signature = wallet::send(self.rpc.as_ref(), &signed).await?;
            *stage = Stage::Succeeded;
            info!(%mint, amount, cluster = %self.operator.cluster(), %signature, "tokens minted");
            Ok(signature)
        }

        /// Holding creations (only for missing holdings), then mint and transfer.
        pub async fn build_instructions(&self, mint: &Pubkey, amount: u64) -> Result<Vec<Instruction>, LendingError> {
            let caller = self.wallet.identity();
            let operator = self.operator.pubkey();
            let caller_holding = address::associated_token_address(&caller, mint)?;
            let operator_holding = address::associated_token_address(&operator, mint)?;

            let mut instructions = Vec::with_capacity(4);
            if !probe::exists(self.rpc.as_ref(), &caller_holding).await? {
                instructions.push(ix::create_associated_token_account(&caller, &caller_holding, &caller, mint));
            }
            if !probe::exists(self.rpc.as_ref(), &operator_holding).await? {
                instructions.push(ix::create_associated_token_account(&operator, &operator_holding, &operator, mint));
            }
            instructions.push(spl_token::instruction::mint_to(
                &spl_token::id(),
                mint,
                &operator_holding,
                &operator,
                &[],
                amount,
            )?);
            instructions.push(spl_token::instruction::transfer(
                &spl_token::id(),
                &operator_holding,
                &caller_holding,
                &operator,
                &[],
                amount,
            )?);
            Ok(instructions)
        }
    }
}

// 16. mod telemetry
pub mod telemetry {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    /// Installs the global subscriber; `RUST_LOG` overrides `default_filter`.
    /// Returns false if one was already installed.
    pub fn init_tracing(default_filter: &str) -> bool {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
            .with(tracing_subscriber::fmt::layer().without_time())
            .try_init()
            .is_ok()
    }
}

//! Shared harness: an in-memory ledger that executes lending, associated
//! token and token instructions atomically per request, plus test wallets,
//! oracles and a cache that records invalidations.

#![allow(dead_code)]

use async_trait::async_trait;
use lending_client::{
    address::{self, BankAddresses},
    cache::{MemoryCache, QueryCache, QueryKey, QueryScope, QueryValue},
    config::{ClientConfig, Cluster},
    constants::{ASSOCIATED_TOKEN_PROGRAM_ID, LENDING_PROGRAM_ID},
    ix::LendingInstruction,
    oracle::{OracleError, PriceOracle, PythPushOracle},
    orchestrator::{CancelToken, OperationOrchestrator},
    rpc::{LedgerRpc, RemoteAccount, RpcError, Signature, SubmitError},
    state::{self, BankState, LedgerAccount, UserState},
    wallet::{SignedRequest, Signer, SignerError, UnsignedRequest, Wallet, WalletError},
};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use solana_program::{
    hash::{hashv, Hash},
    instruction::CompiledInstruction,
    message::Message,
    program_option::COption,
    program_pack::Pack,
    pubkey::Pubkey,
    system_program,
};
use spl_token::{
    instruction::TokenInstruction,
    state::{Account as TokenAccount, AccountState, Mint},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

pub const FEE: u64 = 5_000;
pub const ACCOUNT_RENT: u64 = 1_000_000;
pub const TOKEN_RENT: u64 = 2_039_280;
pub const SOL: u64 = 1_000_000_000;

/// Deterministic stand-in for ed25519: signer key followed by the message hash.
pub fn sign_as(key: &Pubkey, message: &[u8]) -> Signature {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(key.as_ref());
    bytes[32..].copy_from_slice(&hashv(&[message]).to_bytes());
    Signature::new(bytes)
}

// --- Harness ---

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Pubkey, RemoteAccount>,
    blockhashes: u64,
    requests: usize,
    attempts: Vec<String>,
    accepted: Vec<String>,
    price_accounts: Vec<Pubkey>,
    races: HashMap<Pubkey, RemoteAccount>,
    scripted: VecDeque<SubmitError>,
    fail_reads: bool,
}

pub struct MemoryLedger {
    program_id: Pubkey,
    state: Mutex<LedgerState>,
    jitter: Option<Mutex<XorShiftRng>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self { program_id: LENDING_PROGRAM_ID, state: Mutex::new(LedgerState::default()), jitter: None }
    }

    /// Every call yields to the scheduler a random number of times.
    pub fn with_jitter(seed: u64) -> Self {
        Self { jitter: Some(Mutex::new(XorShiftRng::seed_from_u64(seed))), ..Self::new() }
    }

    async fn jitter(&self) {
        let spins = match &self.jitter {
            Some(rng) => rng.lock().unwrap().gen_range(0..4),
            None => 0,
        };
        for _ in 0..spins {
            tokio::task::yield_now().await;
        }
    }

    pub fn fund(&self, key: &Pubkey, lamports: u64) {
        let mut state = self.state.lock().unwrap();
        let account = state.accounts.entry(*key).or_insert_with(|| RemoteAccount {
            owner: system_program::id(),
            lamports: 0,
            data: vec![],
        });
        account.lamports += lamports;
    }

    pub fn lamports(&self, key: &Pubkey) -> u64 {
        self.account(key).map_or(0, |a| a.lamports)
    }

    pub fn account(&self, key: &Pubkey) -> Option<RemoteAccount> {
        self.state.lock().unwrap().accounts.get(key).cloned()
    }

    pub fn insert_account(&self, key: Pubkey, account: RemoteAccount) {
        self.state.lock().unwrap().accounts.insert(key, account);
    }

    pub fn create_mint(&self, mint: &Pubkey, authority: &Pubkey, decimals: u8) {
        let mut data = vec![0u8; Mint::LEN];
        let mint_state = Mint {
            mint_authority: COption::Some(*authority),
            supply: 0,
            decimals,
            is_initialized: true,
            freeze_authority: COption::None,
        };
        Mint::pack(mint_state, &mut data).unwrap();
        self.insert_account(*mint, RemoteAccount { owner: spl_token::id(), lamports: TOKEN_RENT, data });
    }

    /// Credits `owner`'s associated holding, creating it if needed.
    pub fn credit_tokens(&self, owner: &Pubkey, mint: &Pubkey, amount: u64) -> Pubkey {
        let holding = address::associated_token_address(owner, mint).unwrap();
        let mut state = self.state.lock().unwrap();
        let mut account = token_account(&state.accounts, &holding).unwrap_or_else(|| new_holding(owner, mint));
        account.amount += amount;
        write_token_account(&mut state.accounts, holding, account);
        holding
    }

    pub fn token_balance(&self, holding: &Pubkey) -> u64 {
        token_account(&self.state.lock().unwrap().accounts, holding).map_or(0, |a| a.amount)
    }

    pub fn holding_balance(&self, owner: &Pubkey, mint: &Pubkey) -> u64 {
        self.token_balance(&address::associated_token_address(owner, mint).unwrap())
    }

    pub fn bank(&self, mint: &Pubkey) -> Option<BankState> {
        let address = address::bank_address(&self.program_id, mint).unwrap();
        self.account(&address).and_then(|a| state::unpack(&a.data).ok())
    }

    pub fn user(&self, identity: &Pubkey) -> Option<UserState> {
        let address = address::user_address(&self.program_id, identity).unwrap();
        self.account(&address).and_then(|a| state::unpack(&a.data).ok())
    }

    /// Places a bank and its treasury directly, as if created earlier.
    pub fn seed_bank(&self, mint: &Pubkey, authority: &Pubkey, liquidity: u64) -> BankAddresses {
        let bank = BankAddresses::derive(&self.program_id, mint).unwrap();
        let mut state = self.state.lock().unwrap();
        state.accounts.insert(bank.bank, program_account(&self.program_id, &new_bank(authority, mint, 80, 75)));
        let mut treasury = new_holding(&bank.treasury, mint);
        treasury.amount = liquidity;
        write_token_account(&mut state.accounts, bank.treasury, treasury);
        bank
    }

    pub fn seed_user(&self, identity: &Pubkey, usdc_address: &Pubkey) -> Pubkey {
        let address = address::user_address(&self.program_id, identity).unwrap();
        self.insert_account(address, program_account(&self.program_id, &new_user(identity, usdc_address)));
        address
    }

    /// `account` appears right after the next probe of `address` reports
    /// it absent, as though another client won the race.
    pub fn race_on_probe(&self, address: Pubkey, account: RemoteAccount) {
        self.state.lock().unwrap().races.insert(address, account);
    }

    pub fn script_failure(&self, err: SubmitError) {
        self.state.lock().unwrap().scripted.push_back(err);
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    /// Instruction names of every submitted request, accepted or not.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn accepted(&self) -> Vec<String> {
        self.state.lock().unwrap().accepted.clone()
    }

    pub fn accepted_count(&self, name: &str) -> usize {
        self.accepted().iter().filter(|n| n.as_str() == name).count()
    }

    pub fn price_accounts(&self) -> Vec<Pubkey> {
        self.state.lock().unwrap().price_accounts.clone()
    }
}

#[async_trait]
impl LedgerRpc for MemoryLedger {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, RpcError> {
        self.jitter().await;
        let mut state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(RpcError::Transport("connection refused".into()));
        }
        let found = state.accounts.get(address).cloned();
        if found.is_none() {
            if let Some(account) = state.races.remove(address) {
                state.accounts.insert(*address, account);
            }
        }
        Ok(found)
    }

    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        discriminator: &[u8; 8],
    ) -> Result<Vec<(Pubkey, RemoteAccount)>, RpcError> {
        self.jitter().await;
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(RpcError::Transport("connection refused".into()));
        }
        let mut found: Vec<_> = state
            .accounts
            .iter()
            .filter(|(_, a)| a.owner == *program_id && a.data.starts_with(discriminator))
            .map(|(k, a)| (*k, a.clone()))
            .collect();
        found.sort_by_key(|(k, _)| *k);
        Ok(found)
    }

    async fn latest_blockhash(&self) -> Result<Hash, RpcError> {
        self.jitter().await;
        let mut state = self.state.lock().unwrap();
        state.blockhashes += 1;
        Ok(hashv(&[state.blockhashes.to_le_bytes().as_ref()]))
    }

    async fn send_request(&self, request: &SignedRequest) -> Result<Signature, SubmitError> {
        self.jitter().await;
        let mut state = self.state.lock().unwrap();
        state.requests += 1;

        let message = request.message();
        let names: Vec<String> = message.instructions.iter().map(|ix| instruction_name(message, ix)).collect();
        state.attempts.extend(names.iter().cloned());

        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }

        let bytes = message.serialize();
        if request.signatures().len() != message.header.num_required_signatures as usize
            || request
                .signers()
                .iter()
                .zip(request.signatures())
                .any(|(key, sig)| *sig != sign_as(key, &bytes))
        {
            return Err(SubmitError::new("Transaction signature verification failure"));
        }

        let payer = message.account_keys[0];
        match state.accounts.get_mut(&payer) {
            Some(account) if account.lamports >= FEE => account.lamports -= FEE,
            _ => {
                return Err(SubmitError::new(
                    "Transaction simulation failed: Attempt to debit an account but found no record of a prior credit.",
                ))
            }
        }

        let mut runtime = Runtime {
            program_id: self.program_id,
            message,
            accounts: state.accounts.clone(),
            prices: Vec::new(),
        };
        for (index, ix) in message.instructions.iter().enumerate() {
            runtime.execute(index, ix)?;
        }

        let Runtime { accounts, prices, .. } = runtime;
        state.accounts = accounts;
        state.price_accounts.extend(prices);
        state.accepted.extend(names);
        Ok(request.signatures()[0])
    }
}

fn instruction_name(message: &Message, ix: &CompiledInstruction) -> String {
    let program = message.account_keys[ix.program_id_index as usize];
    if program == ASSOCIATED_TOKEN_PROGRAM_ID {
        "create_associated_token_account".into()
    } else if program == spl_token::id() {
        match TokenInstruction::unpack(&ix.data) {
            Ok(TokenInstruction::MintTo { .. }) => "mint_to".into(),
            Ok(TokenInstruction::Transfer { .. }) => "transfer".into(),
            _ => "token".into(),
        }
    } else {
        LendingInstruction::decode(&ix.data).map_or_else(|_| "unknown".into(), |i| i.name().into())
    }
}

// --- Builders ---

fn new_bank(authority: &Pubkey, mint: &Pubkey, liquidation_threshold: u64, max_ltv: u64) -> BankState {
    let mut bank: BankState = bytemuck::Zeroable::zeroed();
    bank.authority = authority.to_bytes();
    bank.mint_address = mint.to_bytes();
    bank.liquidation_threshold = liquidation_threshold;
    bank.max_ltv = max_ltv;
    bank
}

fn new_user(identity: &Pubkey, usdc_address: &Pubkey) -> UserState {
    let mut user: UserState = bytemuck::Zeroable::zeroed();
    user.owner = identity.to_bytes();
    user.usdc_address = usdc_address.to_bytes();
    user
}

pub fn program_account<T: LedgerAccount>(program_id: &Pubkey, value: &T) -> RemoteAccount {
    RemoteAccount { owner: *program_id, lamports: ACCOUNT_RENT, data: state::pack(value) }
}

pub fn bank_account(authority: &Pubkey, mint: &Pubkey) -> RemoteAccount {
    program_account(&LENDING_PROGRAM_ID, &new_bank(authority, mint, 80, 75))
}

pub fn user_account(identity: &Pubkey, usdc_address: &Pubkey) -> RemoteAccount {
    program_account(&LENDING_PROGRAM_ID, &new_user(identity, usdc_address))
}

pub fn holding_account(owner: &Pubkey, mint: &Pubkey) -> RemoteAccount {
    let mut data = vec![0u8; TokenAccount::LEN];
    TokenAccount::pack(new_holding(owner, mint), &mut data).unwrap();
    RemoteAccount { owner: spl_token::id(), lamports: TOKEN_RENT, data }
}

fn new_holding(owner: &Pubkey, mint: &Pubkey) -> TokenAccount {
    TokenAccount {
        mint: *mint,
        owner: *owner,
        state: AccountState::Initialized,
        ..TokenAccount::default()
    }
}

fn token_account(accounts: &HashMap<Pubkey, RemoteAccount>, key: &Pubkey) -> Option<TokenAccount> {
    accounts
        .get(key)
        .filter(|a| a.owner == spl_token::id() && a.data.len() == TokenAccount::LEN)
        .and_then(|a| TokenAccount::unpack(&a.data).ok())
}

fn write_token_account(accounts: &mut HashMap<Pubkey, RemoteAccount>, key: Pubkey, account: TokenAccount) {
    let mut data = vec![0u8; TokenAccount::LEN];
    TokenAccount::pack(account, &mut data).unwrap();
    let lamports = accounts.get(&key).map_or(TOKEN_RENT, |a| a.lamports);
    accounts.insert(key, RemoteAccount { owner: spl_token::id(), lamports, data });
}

// --- Failures ---

fn custom(program: &Pubkey, index: usize, code: u32, log: &str) -> SubmitError {
    SubmitError::new(format!(
        "Transaction simulation failed: Error processing Instruction {index}: custom program error: {code:#x}"
    ))
    .with_logs(vec![
        format!("Program {program} invoke [1]"),
        format!("Program log: {log}"),
        format!("Program {program} failed: custom program error: {code:#x}"),
    ])
}

fn already_in_use(program: &Pubkey, index: usize, address: &Pubkey) -> SubmitError {
    let system = system_program::id();
    SubmitError::new(format!(
        "Transaction simulation failed: Error processing Instruction {index}: custom program error: 0x0"
    ))
    .with_logs(vec![
        format!("Program {program} invoke [1]"),
        format!("Program {system} invoke [2]"),
        format!("Allocate: account Address {{ address: {address}, base: None }} already in use"),
        format!("Program {system} failed: custom program error: 0x0"),
        format!("Program {program} failed: custom program error: 0x0"),
    ])
}

fn not_initialized(program: &Pubkey, index: usize, name: &str) -> SubmitError {
    custom(
        program,
        index,
        3012,
        &format!("AnchorError caused by account: {name}. Error Code: AccountNotInitialized. Error Number: 3012."),
    )
}

fn invalid_account(index: usize) -> SubmitError {
    SubmitError::new(format!(
        "Transaction simulation failed: Error processing Instruction {index}: invalid account data for instruction"
    ))
}

// --- Runtime ---

struct Runtime<'a> {
    program_id: Pubkey,
    message: &'a Message,
    accounts: HashMap<Pubkey, RemoteAccount>,
    prices: Vec<Pubkey>,
}

impl Runtime<'_> {
    fn execute(&mut self, index: usize, ix: &CompiledInstruction) -> Result<(), SubmitError> {
        let program = self.message.account_keys[ix.program_id_index as usize];
        let keys: Vec<Pubkey> = ix.accounts.iter().map(|i| self.message.account_keys[*i as usize]).collect();
        let signer = |position: usize| {
            ix.accounts.get(position).is_some_and(|i| self.message.is_signer(*i as usize))
        };
        let signers: Vec<bool> = (0..keys.len()).map(signer).collect();

        if program == self.program_id {
            self.lending(index, &keys, &signers, &ix.data)
        } else if program == ASSOCIATED_TOKEN_PROGRAM_ID {
            self.create_holding(index, &keys, &signers)
        } else if program == spl_token::id() {
            self.token(index, &keys, &signers, &ix.data)
        } else {
            Err(SubmitError::new(format!(
                "Transaction simulation failed: Error processing Instruction {index}: incorrect program id for instruction"
            )))
        }
    }

    fn pay(&mut self, index: usize, payer: &Pubkey, lamports: u64) -> Result<(), SubmitError> {
        let system = system_program::id();
        let available = self.accounts.get(payer).map_or(0, |a| a.lamports);
        if available < lamports {
            return Err(custom(
                &system,
                index,
                1,
                &format!("Transfer: insufficient lamports {available}, need {lamports}"),
            ));
        }
        if let Some(account) = self.accounts.get_mut(payer) {
            account.lamports -= lamports;
        }
        Ok(())
    }

    fn lending(&mut self, index: usize, keys: &[Pubkey], signers: &[bool], data: &[u8]) -> Result<(), SubmitError> {
        let program = self.program_id;
        let decoded = LendingInstruction::decode(data)
            .map_err(|_| custom(&program, index, 101, "AnchorError occurred. Error Code: InstructionFallbackNotFound."))?;
        if !signers.first().copied().unwrap_or(false) {
            return Err(custom(&program, index, 3010, "AnchorError caused by account: signer. Error Code: AccountNotSigner."));
        }
        let signer = keys[0];

        match decoded {
            LendingInstruction::InitBank { liquidation_threshold, max_ltv } => {
                let (mint, bank, treasury) = (keys[1], keys[2], keys[3]);
                if BankAddresses::derive(&program, &mint).ok() != Some(BankAddresses { bank, treasury }) {
                    return Err(custom(&program, index, 2006, "AnchorError caused by account: bank. Error Code: ConstraintSeeds."));
                }
                for address in [bank, treasury] {
                    if self.accounts.contains_key(&address) {
                        return Err(already_in_use(&program, index, &address));
                    }
                }
                self.pay(index, &signer, ACCOUNT_RENT + TOKEN_RENT)?;
                self.accounts.insert(
                    bank,
                    program_account(&program, &new_bank(&signer, &mint, liquidation_threshold, max_ltv)),
                );
                write_token_account(&mut self.accounts, treasury, new_holding(&treasury, &mint));
            }
            LendingInstruction::InitUser { usdc_address } => {
                let user = keys[1];
                if address::user_address(&program, &signer).ok() != Some(user) {
                    return Err(custom(&program, index, 2006, "AnchorError caused by account: user_account. Error Code: ConstraintSeeds."));
                }
                if self.accounts.contains_key(&user) {
                    return Err(already_in_use(&program, index, &user));
                }
                self.pay(index, &signer, ACCOUNT_RENT)?;
                self.accounts.insert(user, program_account(&program, &new_user(&signer, &usdc_address)));
            }
            LendingInstruction::Deposit { amount } => {
                let (mint, bank_key, treasury, user_key, holding) = (keys[1], keys[2], keys[3], keys[4], keys[5]);
                let (mut bank, mut user) = self.loaded(index, &bank_key, &user_key)?;
                self.move_tokens(index, &holding, &treasury, Some(&signer), &mint, amount)?;
                bank.total_deposits += amount;
                bank.total_deposit_shares += amount;
                if user.usdc_address() == mint {
                    user.deposited_usdc += amount;
                    user.deposited_usdc_shares += amount;
                } else {
                    user.deposited_sol += amount;
                    user.deposited_sol_shares += amount;
                }
                self.accounts.insert(bank_key, program_account(&program, &bank));
                self.accounts.insert(user_key, program_account(&program, &user));
            }
            LendingInstruction::Borrow { amount } => {
                let (mint, bank_key, treasury, user_key, holding) = (keys[1], keys[2], keys[3], keys[4], keys[5]);
                self.prices.push(keys[6]);
                let (mut bank, mut user) = self.loaded(index, &bank_key, &user_key)?;
                if token_account(&self.accounts, &holding).is_none() {
                    self.pay(index, &signer, TOKEN_RENT)?;
                    write_token_account(&mut self.accounts, holding, new_holding(&signer, &mint));
                }
                self.move_tokens(index, &treasury, &holding, None, &mint, amount)?;
                bank.total_borrowed += amount;
                bank.total_borrowed_shares += amount;
                if user.usdc_address() == mint {
                    user.borrowed_usdc += amount;
                    user.borrowed_usdc_shares += amount;
                } else {
                    user.borrowed_sol += amount;
                    user.borrowed_sol_shares += amount;
                }
                self.accounts.insert(bank_key, program_account(&program, &bank));
                self.accounts.insert(user_key, program_account(&program, &user));
            }
        }
        Ok(())
    }

    fn loaded(&self, index: usize, bank: &Pubkey, user: &Pubkey) -> Result<(BankState, UserState), SubmitError> {
        let program = self.program_id;
        let bank = self
            .accounts
            .get(bank)
            .and_then(|a| state::unpack::<BankState>(&a.data).ok())
            .ok_or_else(|| not_initialized(&program, index, "bank"))?;
        let user = self
            .accounts
            .get(user)
            .and_then(|a| state::unpack::<UserState>(&a.data).ok())
            .ok_or_else(|| not_initialized(&program, index, "user_account"))?;
        Ok((bank, user))
    }

    /// `authority: None` is a program-signed move out of a treasury.
    fn move_tokens(
        &mut self,
        index: usize,
        from: &Pubkey,
        to: &Pubkey,
        authority: Option<&Pubkey>,
        mint: &Pubkey,
        amount: u64,
    ) -> Result<(), SubmitError> {
        let token = spl_token::id();
        let mut source = token_account(&self.accounts, from).ok_or_else(|| invalid_account(index))?;
        let mut dest = token_account(&self.accounts, to).ok_or_else(|| invalid_account(index))?;
        if source.mint != *mint || dest.mint != *mint {
            return Err(custom(&token, index, 3, "Error: Account not associated with this Mint"));
        }
        if authority.is_some_and(|a| *a != source.owner) {
            return Err(custom(&token, index, 4, "Error: owner does not match"));
        }
        if source.amount < amount {
            return Err(custom(&token, index, 1, "Error: insufficient funds"));
        }
        source.amount -= amount;
        dest.amount += amount;
        write_token_account(&mut self.accounts, *from, source);
        write_token_account(&mut self.accounts, *to, dest);
        Ok(())
    }

    fn create_holding(&mut self, index: usize, keys: &[Pubkey], signers: &[bool]) -> Result<(), SubmitError> {
        let (payer, holding, owner, mint) = (keys[0], keys[1], keys[2], keys[3]);
        if !signers[0] {
            return Err(SubmitError::new("Transaction simulation failed: missing required signature for instruction"));
        }
        if address::associated_token_address(&owner, &mint).ok() != Some(holding) {
            return Err(SubmitError::new(format!(
                "Transaction simulation failed: Error processing Instruction {index}: Provided seeds do not result in a valid address"
            )));
        }
        if !self.accounts.get(&mint).is_some_and(|a| a.owner == spl_token::id()) {
            return Err(invalid_account(index));
        }
        if self.accounts.contains_key(&holding) {
            return Err(already_in_use(&ASSOCIATED_TOKEN_PROGRAM_ID, index, &holding));
        }
        self.pay(index, &payer, TOKEN_RENT)?;
        write_token_account(&mut self.accounts, holding, new_holding(&owner, &mint));
        Ok(())
    }

    fn token(&mut self, index: usize, keys: &[Pubkey], signers: &[bool], data: &[u8]) -> Result<(), SubmitError> {
        let token = spl_token::id();
        match TokenInstruction::unpack(data).map_err(|_| invalid_account(index))? {
            TokenInstruction::MintTo { amount } => {
                let (mint_key, dest_key, authority) = (keys[0], keys[1], keys[2]);
                let mint_account = self.accounts.get(&mint_key).ok_or_else(|| invalid_account(index))?;
                let mut mint = Mint::unpack(&mint_account.data).map_err(|_| invalid_account(index))?;
                if mint.mint_authority != COption::Some(authority) || !signers[2] {
                    return Err(custom(&token, index, 4, "Error: owner does not match"));
                }
                let mut dest = token_account(&self.accounts, &dest_key).ok_or_else(|| invalid_account(index))?;
                mint.supply += amount;
                dest.amount += amount;
                let mut data = vec![0u8; Mint::LEN];
                Mint::pack(mint, &mut data).map_err(|_| invalid_account(index))?;
                if let Some(account) = self.accounts.get_mut(&mint_key) {
                    account.data = data;
                }
                write_token_account(&mut self.accounts, dest_key, dest);
                Ok(())
            }
            TokenInstruction::Transfer { amount } => {
                let (source, dest, authority) = (keys[0], keys[1], keys[2]);
                if !signers[2] {
                    return Err(custom(&token, index, 4, "Error: owner does not match"));
                }
                let mint = token_account(&self.accounts, &source).ok_or_else(|| invalid_account(index))?.mint;
                self.move_tokens(index, &source, &dest, Some(&authority), &mint, amount)
            }
            _ => Err(invalid_account(index)),
        }
    }
}

// --- Wallets ---

pub struct TestWallet {
    key: Pubkey,
    reject: AtomicBool,
    signed: AtomicUsize,
}

impl TestWallet {
    pub fn new() -> Self {
        Self { key: Pubkey::new_unique(), reject: AtomicBool::new(false), signed: AtomicUsize::new(0) }
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Wallet for TestWallet {
    fn identity(&self) -> Pubkey {
        self.key
    }

    async fn sign_request(&self, request: &UnsignedRequest) -> Result<Signature, WalletError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(WalletError::Rejected("user declined".into()));
        }
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(sign_as(&self.key, &request.message_bytes()))
    }
}

pub struct TestSigner {
    key: Pubkey,
}

impl TestSigner {
    pub fn new() -> Self {
        Self { key: Pubkey::new_unique() }
    }
}

impl Signer for TestSigner {
    fn pubkey(&self) -> Pubkey {
        self.key
    }

    fn sign_message(&self, message: &[u8]) -> Result<Signature, SignerError> {
        Ok(sign_as(&self.key, message))
    }
}

// --- Oracles ---

pub struct FailingOracle;

#[async_trait]
impl PriceOracle for FailingOracle {
    async fn price_account(&self, feed_id: &str) -> Result<Pubkey, OracleError> {
        Err(OracleError::Unavailable(format!("no price update for {feed_id}")))
    }
}

/// Resolves normally but cancels `cancel` while the lookup is in flight.
pub struct CancellingOracle {
    pub cancel: CancelToken,
    pub inner: PythPushOracle,
}

#[async_trait]
impl PriceOracle for CancellingOracle {
    async fn price_account(&self, feed_id: &str) -> Result<Pubkey, OracleError> {
        self.cancel.cancel();
        self.inner.price_account(feed_id).await
    }
}

// --- Cache ---

#[derive(Default)]
pub struct RecordingCache {
    inner: MemoryCache,
    invalidations: Mutex<Vec<(Cluster, QueryScope)>>,
}

impl RecordingCache {
    pub fn invalidations(&self) -> Vec<(Cluster, QueryScope)> {
        self.invalidations.lock().unwrap().clone()
    }

    pub fn invalidation_count(&self, scope: QueryScope) -> usize {
        self.invalidations().iter().filter(|(_, s)| *s == scope).count()
    }
}

#[async_trait]
impl QueryCache for RecordingCache {
    async fn get(&self, key: &QueryKey) -> Option<QueryValue> {
        self.inner.get(key).await
    }

    async fn put(&self, key: QueryKey, value: QueryValue) {
        self.inner.put(key, value).await
    }

    async fn invalidate(&self, cluster: Cluster, scope: QueryScope) {
        self.invalidations.lock().unwrap().push((cluster, scope));
        self.inner.invalidate(cluster, scope).await
    }
}

// --- Fixture ---

pub struct Fixture {
    pub ledger: Arc<MemoryLedger>,
    pub wallet: Arc<TestWallet>,
    pub cache: Arc<RecordingCache>,
    pub orchestrator: OperationOrchestrator,
}

pub fn config() -> ClientConfig {
    ClientConfig { cluster: Cluster::Localnet, ..ClientConfig::default() }
}

pub fn fixture_with(ledger: Arc<MemoryLedger>, oracle: Arc<dyn PriceOracle>) -> Fixture {
    let wallet = Arc::new(TestWallet::new());
    ledger.fund(&wallet.identity(), 10 * SOL);
    let cache = Arc::new(RecordingCache::default());
    let orchestrator = OperationOrchestrator::new(config(), ledger.clone(), wallet.clone(), oracle, cache.clone());
    Fixture { ledger, wallet, cache, orchestrator }
}

pub fn fixture() -> Fixture {
    fixture_with(Arc::new(MemoryLedger::new()), Arc::new(PythPushOracle::default()))
}

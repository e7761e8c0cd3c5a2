//! Double-entry ledger store
//!
//! Chart of accounts plus immutable journal entries and lines. There is no
//! balance column anywhere: an account balance is always the sum of its
//! lines up to a point in time.
//!
//! # Invariants
//!
//! - Every entry has at least two lines, each with a positive amount
//! - Σ(debit lines) == Σ(credit lines) for every entry, exactly
//! - Entries and lines are never rewritten; corrections are reversal entries
//! - Header and lines commit in one atomic unit or not at all

use crate::{
    events::{EngineEvent, Outbox},
    storage::{cf, keys, Storage, WriteTxn},
    types::{AccountId, ActorRef, Direction, EntryId, LineId, Money},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Codes of the system-protected accounts created at bootstrap
pub mod codes {
    /// Operating cash
    pub const CASH: &str = "CASH";
    /// Funds confirmed by the payment gateway, not yet settled
    pub const GATEWAY_CLEARING: &str = "GATEWAY_CLEARING";
    /// Platform obligation to investors for wallet balances
    pub const INVESTOR_WALLETS: &str = "INVESTOR_WALLETS";
    /// Purchased share inventory held for allocation
    pub const SHARE_INVENTORY: &str = "SHARE_INVENTORY";
    /// Platform equity
    pub const PLATFORM_EQUITY: &str = "PLATFORM_EQUITY";
    /// Fees charged to investors
    pub const FEE_INCOME: &str = "FEE_INCOME";
    /// Gains from approved manual adjustments
    pub const ADJUSTMENT_INCOME: &str = "ADJUSTMENT_INCOME";
    /// Losses from approved manual adjustments
    pub const ADJUSTMENT_EXPENSE: &str = "ADJUSTMENT_EXPENSE";
}

/// Account classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    /// Asset
    Asset,
    /// Liability
    Liability,
    /// Equity
    Equity,
    /// Income
    Income,
    /// Expense
    Expense,
}

impl AccountType {
    /// Side on which the account's balance grows
    pub fn normal_balance(&self) -> Direction {
        match self {
            AccountType::Asset | AccountType::Expense => Direction::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => {
                Direction::Credit
            }
        }
    }

    /// Upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "ASSET",
            AccountType::Liability => "LIABILITY",
            AccountType::Equity => "EQUITY",
            AccountType::Income => "INCOME",
            AccountType::Expense => "EXPENSE",
        }
    }
}

/// Chart-of-accounts entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,
    /// Unique account code
    pub code: String,
    /// Classification
    pub account_type: AccountType,
    /// Side on which the balance grows (derived from the type)
    pub normal_balance: Direction,
    /// Display name (the only mutable field)
    pub name: String,
    /// System accounts cannot be removed
    pub system: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One requested line of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    /// Account to post to
    pub account_id: AccountId,
    /// Debit or credit
    pub direction: Direction,
    /// Amount (must be positive)
    pub amount: Money,
}

impl LineRequest {
    /// Debit line
    pub fn debit(account_id: AccountId, amount: Money) -> Self {
        Self { account_id, direction: Direction::Debit, amount }
    }

    /// Credit line
    pub fn credit(account_id: AccountId, amount: Money) -> Self {
        Self { account_id, direction: Direction::Credit, amount }
    }
}

/// Request to post one balanced entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEntry {
    /// Lines (at least two, balanced)
    pub lines: Vec<LineRequest>,
    /// Business reference type (payment, listing, investment, ...)
    pub reference_type: String,
    /// Business reference id
    pub reference_id: String,
    /// Free-text description
    pub description: String,
    /// Accounting date the entry is booked on
    pub entry_date: DateTime<Utc>,
    /// Who posted it
    pub created_by: ActorRef,
}

/// Journal entry header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Entry ID
    pub id: EntryId,
    /// Business reference type
    pub reference_type: String,
    /// Business reference id
    pub reference_id: String,
    /// Description
    pub description: String,
    /// Accounting date
    pub entry_date: DateTime<Utc>,
    /// Creator
    pub created_by: ActorRef,
    /// Wall-clock time the entry was written
    pub created_at: DateTime<Utc>,
    /// Whether this entry reverses another
    pub is_reversal: bool,
    /// Entry this one reverses
    pub reverses: Option<EntryId>,
    /// Sum of debit lines (equals the sum of credit lines)
    pub total: Money,
    /// Number of lines
    pub line_count: u32,
}

/// Journal line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    /// Line ID
    pub id: LineId,
    /// Owning entry
    pub entry_id: EntryId,
    /// Position within the entry
    pub position: u32,
    /// Account
    pub account_id: AccountId,
    /// Debit or credit
    pub direction: Direction,
    /// Amount (always positive)
    pub amount: Money,
    /// Accounting date (copied from the entry)
    pub entry_date: DateTime<Utc>,
}

/// Derived balance of one account as of a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account
    pub account_id: AccountId,
    /// Account code
    pub code: String,
    /// Sum of debit lines
    pub debits: Money,
    /// Sum of credit lines
    pub credits: Money,
    /// Balance on the account's normal side
    pub balance: Money,
    /// Cut-off (inclusive)
    pub as_of: DateTime<Utc>,
}

/// Balances of every account at one cut-off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialBalance {
    /// Cut-off (inclusive)
    pub as_of: DateTime<Utc>,
    /// Per-account balances, in account-id order
    pub accounts: Vec<AccountBalance>,
    /// Σ debits over the whole book
    pub total_debits: Money,
    /// Σ credits over the whole book
    pub total_credits: Money,
}

impl TrialBalance {
    /// Whether the book balances
    pub fn is_balanced(&self) -> bool {
        self.total_debits == self.total_credits
    }
}

/// Ids of the system-protected accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartOfAccounts {
    /// `CASH`
    pub cash: AccountId,
    /// `GATEWAY_CLEARING`
    pub gateway_clearing: AccountId,
    /// `INVESTOR_WALLETS`
    pub investor_wallets: AccountId,
    /// `SHARE_INVENTORY`
    pub share_inventory: AccountId,
    /// `PLATFORM_EQUITY`
    pub platform_equity: AccountId,
    /// `FEE_INCOME`
    pub fee_income: AccountId,
    /// `ADJUSTMENT_INCOME`
    pub adjustment_income: AccountId,
    /// `ADJUSTMENT_EXPENSE`
    pub adjustment_expense: AccountId,
}

const SYSTEM_ACCOUNTS: &[(&str, AccountType, &str)] = &[
    (codes::CASH, AccountType::Asset, "Operating cash"),
    (codes::GATEWAY_CLEARING, AccountType::Asset, "Payment gateway clearing"),
    (codes::INVESTOR_WALLETS, AccountType::Liability, "Investor wallet balances"),
    (codes::SHARE_INVENTORY, AccountType::Asset, "Share inventory"),
    (codes::PLATFORM_EQUITY, AccountType::Equity, "Platform equity"),
    (codes::FEE_INCOME, AccountType::Income, "Fee income"),
    (codes::ADJUSTMENT_INCOME, AccountType::Income, "Manual adjustment income"),
    (codes::ADJUSTMENT_EXPENSE, AccountType::Expense, "Manual adjustment expense"),
];

/// Validate line shape and balance; returns the entry total.
///
/// Any malformed line set (fewer than two lines, a non-positive amount, or
/// unequal sides) is reported as [`Error::UnbalancedEntry`].
pub fn validate_lines(lines: &[LineRequest]) -> Result<Money> {
    let debits = Money::checked_sum(
        lines.iter().filter(|l| l.direction == Direction::Debit).map(|l| l.amount),
    )?;
    let credits = Money::checked_sum(
        lines.iter().filter(|l| l.direction == Direction::Credit).map(|l| l.amount),
    )?;

    let malformed = lines.len() < 2 || lines.iter().any(|l| !l.amount.is_positive());
    if malformed || debits != credits {
        return Err(Error::UnbalancedEntry {
            debits: debits.minor(),
            credits: credits.minor(),
            lines: lines.len(),
        });
    }
    Ok(debits)
}

fn reversal_marker(entry_id: EntryId) -> Vec<u8> {
    keys::join(&[b"entry/", entry_id.as_bytes()])
}

/// Ledger store service
#[derive(Debug)]
pub struct Ledger {
    storage: Arc<Storage>,
    outbox: Outbox,
}

impl Ledger {
    /// Create ledger service over an open store
    pub fn new(storage: Arc<Storage>, outbox: Outbox) -> Self {
        Self { storage, outbox }
    }

    /// Create the system-protected accounts; re-running returns existing ids
    pub fn bootstrap_chart(&self) -> Result<ChartOfAccounts> {
        let txn = self.storage.begin();
        let mut ids = Vec::with_capacity(SYSTEM_ACCOUNTS.len());
        let mut created = 0usize;

        for (code, account_type, name) in SYSTEM_ACCOUNTS {
            match txn.lock::<AccountId>(cf::ACCOUNT_CODES, code.as_bytes())? {
                Some(id) => ids.push(id),
                None => {
                    let account = Self::stage_account(&txn, code, *account_type, name, true)?;
                    ids.push(account.id);
                    created += 1;
                }
            }
        }
        txn.commit()?;

        if created > 0 {
            info!(created, "Bootstrapped chart of accounts");
        }
        self.chart()
    }

    /// Look up the system-protected accounts
    pub fn chart(&self) -> Result<ChartOfAccounts> {
        Ok(ChartOfAccounts {
            cash: self.account_id(codes::CASH)?,
            gateway_clearing: self.account_id(codes::GATEWAY_CLEARING)?,
            investor_wallets: self.account_id(codes::INVESTOR_WALLETS)?,
            share_inventory: self.account_id(codes::SHARE_INVENTORY)?,
            platform_equity: self.account_id(codes::PLATFORM_EQUITY)?,
            fee_income: self.account_id(codes::FEE_INCOME)?,
            adjustment_income: self.account_id(codes::ADJUSTMENT_INCOME)?,
            adjustment_expense: self.account_id(codes::ADJUSTMENT_EXPENSE)?,
        })
    }

    /// Resolve an account code
    pub fn account_id(&self, code: &str) -> Result<AccountId> {
        self.storage
            .require(cf::ACCOUNT_CODES, code.as_bytes(), &format!("account code {}", code))
    }

    /// Create a non-system account
    pub fn create_account(&self, code: &str, account_type: AccountType, name: &str) -> Result<Account> {
        let code = code.trim();
        let result: Result<Account> = (|| {
            let txn = self.storage.begin();
            if txn.lock::<AccountId>(cf::ACCOUNT_CODES, code.as_bytes())?.is_some() {
                return Err(Error::InvalidRequest(format!("account code {} already exists", code)));
            }
            let account = Self::stage_account(&txn, code, account_type, name, false)?;
            txn.commit()?;
            Ok(account)
        })();

        let account = self.outbox.metrics().observe(result)?;
        info!(account_id = %account.id, code = %account.code, "Account created");
        Ok(account)
    }

    fn stage_account(
        txn: &WriteTxn<'_>,
        code: &str,
        account_type: AccountType,
        name: &str,
        system: bool,
    ) -> Result<Account> {
        let code = code.trim();
        if code.is_empty() || code.len() > 64 {
            return Err(Error::InvalidRequest("account code must be 1-64 characters".to_string()));
        }

        let account = Account {
            id: AccountId::new(),
            code: code.to_string(),
            account_type,
            normal_balance: account_type.normal_balance(),
            name: name.to_string(),
            system,
            created_at: Utc::now(),
        };
        txn.insert(cf::ACCOUNT_CODES, code.as_bytes(), &account.id)?;
        txn.insert(cf::ACCOUNTS, account.id.as_bytes(), &account)?;
        Ok(account)
    }

    /// Remove an account that is neither system-protected nor posted to
    pub fn remove_account(&self, account_id: AccountId) -> Result<()> {
        let result: Result<()> = (|| {
            let txn = self.storage.begin();
            // Exclusive lock waits out in-flight postings, which hold it shared.
            let account: Account = txn
                .lock(cf::ACCOUNTS, account_id.as_bytes())?
                .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))?;

            if account.system {
                return Err(Error::InvalidRequest(format!(
                    "account {} is system-protected",
                    account.code
                )));
            }
            let posted: Vec<(Vec<u8>, JournalLine)> =
                self.storage.scan_prefix(cf::ACCOUNT_LINES, account_id.as_bytes())?;
            if !posted.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "account {} has {} posted lines",
                    account.code,
                    posted.len()
                )));
            }

            txn.delete(cf::ACCOUNT_CODES, account.code.as_bytes())?;
            txn.delete(cf::ACCOUNTS, account_id.as_bytes())?;
            txn.commit()
        })();

        self.outbox.metrics().observe(result)?;
        info!(account_id = %account_id, "Account removed");
        Ok(())
    }

    /// Rename an account (metadata is the only mutable part of an account)
    pub fn update_account_metadata(&self, account_id: AccountId, name: &str) -> Result<Account> {
        let txn = self.storage.begin();
        let mut account: Account = txn
            .lock(cf::ACCOUNTS, account_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))?;
        account.name = name.to_string();
        txn.put(cf::ACCOUNTS, account_id.as_bytes(), &account)?;
        txn.commit()?;
        Ok(account)
    }

    /// Get account
    pub fn account(&self, account_id: AccountId) -> Result<Account> {
        self.storage
            .require(cf::ACCOUNTS, account_id.as_bytes(), &format!("account {}", account_id))
    }

    /// Post a balanced entry atomically
    pub fn post_entry(&self, request: PostEntry) -> Result<JournalEntry> {
        let mut events = Vec::new();
        let result: Result<JournalEntry> = (|| {
            let txn = self.storage.begin();
            let entry = self.stage_entry(&txn, request, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(entry)
        })();

        match self.outbox.metrics().observe(result) {
            Ok(entry) => {
                info!(
                    entry_id = %entry.id,
                    reference_type = %entry.reference_type,
                    reference_id = %entry.reference_id,
                    total = %entry.total,
                    "Journal entry posted"
                );
                Ok(entry)
            }
            Err(e) => {
                warn!(error = %e, "Journal entry rejected");
                Err(e)
            }
        }
    }

    /// Stage a balanced entry into an open write unit
    pub(crate) fn stage_entry(
        &self,
        txn: &WriteTxn<'_>,
        request: PostEntry,
        events: &mut Vec<EngineEvent>,
    ) -> Result<JournalEntry> {
        self.stage_entry_inner(txn, request, None, events)
    }

    fn stage_entry_inner(
        &self,
        txn: &WriteTxn<'_>,
        request: PostEntry,
        reverses: Option<EntryId>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<JournalEntry> {
        let total = validate_lines(&request.lines)?;

        for line in &request.lines {
            if txn.lock_shared::<Account>(cf::ACCOUNTS, line.account_id.as_bytes())?.is_none() {
                return Err(Error::NotFound(format!("account {}", line.account_id)));
            }
        }

        let entry = JournalEntry {
            id: EntryId::new(),
            reference_type: request.reference_type,
            reference_id: request.reference_id,
            description: request.description,
            entry_date: request.entry_date,
            created_by: request.created_by,
            created_at: Utc::now(),
            is_reversal: reverses.is_some(),
            reverses,
            total,
            line_count: request.lines.len() as u32,
        };
        txn.insert(cf::ENTRIES, entry.id.as_bytes(), &entry)?;

        for (position, line) in request.lines.iter().enumerate() {
            let row = JournalLine {
                id: LineId::new(),
                entry_id: entry.id,
                position: position as u32,
                account_id: line.account_id,
                direction: line.direction,
                amount: line.amount,
                entry_date: entry.entry_date,
            };
            txn.insert(
                cf::LINES,
                &keys::join(&[entry.id.as_bytes(), &keys::seq(position as u64)]),
                &row,
            )?;
            txn.insert(
                cf::ACCOUNT_LINES,
                &keys::join(&[
                    line.account_id.as_bytes(),
                    &keys::timestamp(entry.entry_date),
                    row.id.as_bytes(),
                ]),
                &row,
            )?;
        }

        events.push(EngineEvent::LedgerEntryPosted {
            entry_id: entry.id,
            reference_type: entry.reference_type.clone(),
            reference_id: entry.reference_id.clone(),
            total,
            is_reversal: entry.is_reversal,
        });
        Ok(entry)
    }

    /// Post a compensating entry with every line flipped
    pub fn reverse_entry(&self, entry_id: EntryId, reason: &str, actor: ActorRef) -> Result<JournalEntry> {
        let mut events = Vec::new();
        let result: Result<JournalEntry> = (|| {
            let txn = self.storage.begin();
            let entry = self.stage_reversal(&txn, entry_id, reason, actor, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(entry)
        })();

        let reversal = self.outbox.metrics().observe(result)?;
        info!(entry_id = %entry_id, reversal_id = %reversal.id, "Journal entry reversed");
        Ok(reversal)
    }

    pub(crate) fn stage_reversal(
        &self,
        txn: &WriteTxn<'_>,
        entry_id: EntryId,
        reason: &str,
        actor: ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<JournalEntry> {
        let original: JournalEntry = txn
            .get(cf::ENTRIES, entry_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("entry {}", entry_id)))?;
        if original.is_reversal {
            return Err(Error::InvalidRequest(format!(
                "entry {} is itself a reversal",
                entry_id
            )));
        }

        let marker = reversal_marker(entry_id);
        if let Some(existing) = txn.lock::<EntryId>(cf::REVERSALS, &marker)? {
            return Err(Error::AlreadyReversed(format!(
                "entry {} reversed by {}",
                entry_id, existing
            )));
        }

        let lines = self
            .entry_lines(entry_id)?
            .into_iter()
            .map(|line| LineRequest {
                account_id: line.account_id,
                direction: line.direction.flip(),
                amount: line.amount,
            })
            .collect();

        let reversal = self.stage_entry_inner(
            txn,
            PostEntry {
                lines,
                reference_type: original.reference_type.clone(),
                reference_id: original.reference_id.clone(),
                description: format!("Reversal of {}: {}", entry_id, reason),
                entry_date: Utc::now(),
                created_by: actor,
            },
            Some(entry_id),
            events,
        )?;
        txn.insert(cf::REVERSALS, &marker, &reversal.id)?;
        Ok(reversal)
    }

    /// Get entry header
    pub fn entry(&self, entry_id: EntryId) -> Result<JournalEntry> {
        self.storage
            .require(cf::ENTRIES, entry_id.as_bytes(), &format!("entry {}", entry_id))
    }

    /// Every entry header
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        Ok(self
            .storage
            .scan_all::<JournalEntry>(cf::ENTRIES)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Lines of one entry, in posting order
    pub fn entry_lines(&self, entry_id: EntryId) -> Result<Vec<JournalLine>> {
        Ok(self
            .storage
            .scan_prefix::<JournalLine>(cf::LINES, entry_id.as_bytes())?
            .into_iter()
            .map(|(_, line)| line)
            .collect())
    }

    /// Lines posted to an account up to `as_of` (inclusive), oldest first
    pub fn account_lines(&self, account_id: AccountId, as_of: DateTime<Utc>) -> Result<Vec<JournalLine>> {
        Ok(self
            .storage
            .scan_prefix::<JournalLine>(cf::ACCOUNT_LINES, account_id.as_bytes())?
            .into_iter()
            .map(|(_, line)| line)
            .take_while(|line| line.entry_date <= as_of)
            .collect())
    }

    /// Balance derived by summing the account's lines up to `as_of`
    pub fn account_balance(&self, account_id: AccountId, as_of: DateTime<Utc>) -> Result<AccountBalance> {
        let account = self.account(account_id)?;
        let lines = self.account_lines(account_id, as_of)?;
        Self::fold_balance(&account, &lines, as_of)
    }

    fn fold_balance(account: &Account, lines: &[JournalLine], as_of: DateTime<Utc>) -> Result<AccountBalance> {
        let mut debits = Money::ZERO;
        let mut credits = Money::ZERO;
        for line in lines {
            match line.direction {
                Direction::Debit => debits = debits.checked_add(line.amount)?,
                Direction::Credit => credits = credits.checked_add(line.amount)?,
            }
        }
        let balance = match account.normal_balance {
            Direction::Debit => debits.checked_sub(credits)?,
            Direction::Credit => credits.checked_sub(debits)?,
        };

        Ok(AccountBalance {
            account_id: account.id,
            code: account.code.clone(),
            debits,
            credits,
            balance,
            as_of,
        })
    }

    /// Derived balance of every account
    pub fn trial_balance(&self, as_of: DateTime<Utc>) -> Result<TrialBalance> {
        let accounts: Vec<(Vec<u8>, Account)> = self.storage.scan_all(cf::ACCOUNTS)?;

        let mut rows = Vec::with_capacity(accounts.len());
        let mut total_debits = Money::ZERO;
        let mut total_credits = Money::ZERO;
        for (_, account) in accounts {
            let lines = self.account_lines(account.id, as_of)?;
            let row = Self::fold_balance(&account, &lines, as_of)?;
            total_debits = total_debits.checked_add(row.debits)?;
            total_credits = total_credits.checked_add(row.credits)?;
            rows.push(row);
        }

        Ok(TrialBalance { as_of, accounts: rows, total_debits, total_credits })
    }
}

//! Inventory accounting for purchased share lots
//!
//! A lot's remaining value is never stored as a mutable field. Every
//! allocation (and every reversal of one) appends a log row carrying the
//! remaining value before and after it; the current remaining is the newest
//! row's `remaining_after`. Writers lock the lot's head row, so concurrent
//! allocations against one lot serialize and cannot both pass the check.
//!
//! # Invariants
//!
//! - `0 <= remaining <= total_value_received` after every row
//! - Log rows are never edited; a reversal is a new row, at most one per allocation

use crate::{
    events::{EngineEvent, Outbox},
    storage::{cf, keys, Storage, WriteTxn},
    types::{ActorRef, AllocationId, CompanyId, LotId, Money, ProductId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Allowed gap (minor units) between a lot's recorded total and
/// `face × (1 + pct/100)`.
///
/// Applying a fractional percentage to an integer face value cannot always
/// land on a whole minor unit; one minor unit covers that rounding and
/// nothing more.
pub const TOTAL_VALUE_TOLERANCE_MINOR: i64 = 1;

/// Where a lot came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Approved share listing
    Listing {
        /// Listing id
        listing_id: String,
    },
    /// Entered by an operator
    Manual {
        /// Why the lot was entered by hand
        justification: String,
    },
}

impl Provenance {
    /// Source type name
    pub fn source_type(&self) -> &'static str {
        match self {
            Provenance::Listing { .. } => "listing",
            Provenance::Manual { .. } => "manual",
        }
    }
}

/// Request to receive a new lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLot {
    /// Company whose shares were purchased
    pub company_id: CompanyId,
    /// Product the lot is sold under, when distinct from the company listing
    pub product_id: Option<ProductId>,
    /// Provenance
    pub provenance: Provenance,
    /// Face value paid for the block
    pub face_value: Money,
    /// Extra allocation on top of face value, in percent
    pub extra_allocation_pct: Decimal,
    /// Total value received (face plus extra allocation)
    pub total_value_received: Money,
    /// Who received it
    pub received_by: ActorRef,
}

/// Purchased share block (immutable once received)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLot {
    /// Lot ID
    pub id: LotId,
    /// Owning company
    pub company_id: CompanyId,
    /// Product
    pub product_id: Option<ProductId>,
    /// Provenance
    pub provenance: Provenance,
    /// Face value paid
    pub face_value: Money,
    /// Extra allocation percentage
    pub extra_allocation_pct: Decimal,
    /// Total value received
    pub total_value_received: Money,
    /// Receiver
    pub received_by: ActorRef,
    /// Timestamp
    pub received_at: DateTime<Utc>,
}

/// Kind of allocation log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    /// Value issued to an investor
    Allocation,
    /// Value restored by reversing an allocation
    Reversal,
}

/// Immutable allocation log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Row ID
    pub id: AllocationId,
    /// Lot
    pub lot_id: LotId,
    /// Position in the lot's log, starting at 1
    pub sequence: u64,
    /// Allocation or reversal
    pub kind: AllocationKind,
    /// Amount moved (always positive)
    pub amount: Money,
    /// Remaining before this row
    pub remaining_before: Money,
    /// Remaining after this row
    pub remaining_after: Money,
    /// Allocation this row reverses
    pub reverses: Option<AllocationId>,
    /// Business reference (investment id, ...) or reversal reason
    pub reference: Option<String>,
    /// Who wrote the row
    pub created_by: ActorRef,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LotHead {
    sequence: u64,
    last_allocation_id: AllocationId,
}

/// `face × (1 + pct/100)`, rounded half away from zero to a minor unit
pub fn expected_total(face_value: Money, extra_allocation_pct: Decimal) -> Result<Money> {
    let factor = Decimal::ONE
        .checked_add(extra_allocation_pct / Decimal::ONE_HUNDRED)
        .ok_or_else(|| Error::AmountOverflow(format!("1 + {}%", extra_allocation_pct)))?;
    Decimal::from(face_value.minor())
        .checked_mul(factor)
        .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|v| v.to_i64())
        .map(Money::from_minor)
        .ok_or_else(|| {
            Error::AmountOverflow(format!("{} x (1 + {}%)", face_value, extra_allocation_pct))
        })
}

fn reversal_marker(allocation_id: AllocationId) -> Vec<u8> {
    keys::join(&[b"alloc/", allocation_id.as_bytes()])
}

/// Inventory accounting service
#[derive(Debug)]
pub struct Inventory {
    storage: Arc<Storage>,
    outbox: Outbox,
}

impl Inventory {
    /// Create inventory service
    pub fn new(storage: Arc<Storage>, outbox: Outbox) -> Self {
        Self { storage, outbox }
    }

    /// Receive a purchased lot
    pub fn receive_lot(&self, lot: NewLot) -> Result<InventoryLot> {
        let result: Result<InventoryLot> = (|| {
            let txn = self.storage.begin();
            let received = self.stage_receive_lot(&txn, lot)?;
            txn.commit()?;
            Ok(received)
        })();

        let lot = self.outbox.metrics().observe(result)?;
        info!(
            lot_id = %lot.id,
            source = lot.provenance.source_type(),
            total = %lot.total_value_received,
            "Inventory lot received"
        );
        Ok(lot)
    }

    pub(crate) fn stage_receive_lot(&self, txn: &WriteTxn<'_>, lot: NewLot) -> Result<InventoryLot> {
        match &lot.provenance {
            Provenance::Listing { listing_id } if listing_id.trim().is_empty() => {
                return Err(Error::InvalidRequest("listing id is required".to_string()));
            }
            Provenance::Manual { justification } if justification.trim().is_empty() => {
                return Err(Error::InvalidRequest(
                    "manual lots require a justification".to_string(),
                ));
            }
            _ => {}
        }
        if !lot.face_value.is_positive() {
            return Err(Error::InvalidRequest("face value must be positive".to_string()));
        }
        if lot.extra_allocation_pct.is_sign_negative() {
            return Err(Error::InvalidRequest(
                "extra allocation percentage cannot be negative".to_string(),
            ));
        }

        let expected = expected_total(lot.face_value, lot.extra_allocation_pct)?;
        let gap = lot.total_value_received.checked_sub(expected)?.minor().abs();
        if gap > TOTAL_VALUE_TOLERANCE_MINOR {
            return Err(Error::InvalidRequest(format!(
                "total value received {} does not match face {} x (1 + {}%) = {}",
                lot.total_value_received, lot.face_value, lot.extra_allocation_pct, expected
            )));
        }

        let received = InventoryLot {
            id: LotId::new(),
            company_id: lot.company_id,
            product_id: lot.product_id,
            provenance: lot.provenance,
            face_value: lot.face_value,
            extra_allocation_pct: lot.extra_allocation_pct,
            total_value_received: lot.total_value_received,
            received_by: lot.received_by,
            received_at: Utc::now(),
        };
        txn.insert(cf::LOTS, received.id.as_bytes(), &received)?;
        Ok(received)
    }

    /// Allocate value from a lot
    pub fn allocate(
        &self,
        lot_id: LotId,
        amount: Money,
        reference: Option<String>,
        actor: ActorRef,
    ) -> Result<AllocationRecord> {
        let mut events = Vec::new();
        let result: Result<AllocationRecord> = (|| {
            let txn = self.storage.begin();
            let row = self.stage_allocate(&txn, lot_id, amount, reference, actor, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(row)
        })();

        match self.outbox.metrics().observe(result) {
            Ok(row) => {
                info!(
                    allocation_id = %row.id,
                    lot_id = %lot_id,
                    amount = %amount,
                    remaining = %row.remaining_after,
                    "Allocation recorded"
                );
                Ok(row)
            }
            Err(e) => {
                warn!(lot_id = %lot_id, amount = %amount, error = %e, "Allocation rejected");
                Err(e)
            }
        }
    }

    pub(crate) fn stage_allocate(
        &self,
        txn: &WriteTxn<'_>,
        lot_id: LotId,
        amount: Money,
        reference: Option<String>,
        actor: ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<AllocationRecord> {
        if !amount.is_positive() {
            return Err(Error::InvalidRequest(format!(
                "allocation amount must be positive, got {}",
                amount
            )));
        }

        let (lot, head, remaining) = self.lock_lot(txn, lot_id)?;
        if amount > remaining {
            return Err(Error::InsufficientInventory {
                lot_id: lot_id.to_string(),
                requested: amount.minor(),
                remaining: remaining.minor(),
            });
        }

        let after = remaining.checked_sub(amount)?;
        self.stage_row(txn, &lot, head, AllocationKind::Allocation, amount, remaining, after, None, reference, actor, events)
    }

    /// Restore an allocation's value with a logged reversal row
    pub fn reverse_allocation(
        &self,
        allocation_id: AllocationId,
        reason: &str,
        actor: ActorRef,
    ) -> Result<AllocationRecord> {
        let mut events = Vec::new();
        let result: Result<AllocationRecord> = (|| {
            let txn = self.storage.begin();
            let row = self.stage_reverse_allocation(&txn, allocation_id, reason, actor, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(row)
        })();

        let row = self.outbox.metrics().observe(result)?;
        info!(
            allocation_id = %allocation_id,
            reversal_id = %row.id,
            remaining = %row.remaining_after,
            "Allocation reversed"
        );
        Ok(row)
    }

    pub(crate) fn stage_reverse_allocation(
        &self,
        txn: &WriteTxn<'_>,
        allocation_id: AllocationId,
        reason: &str,
        actor: ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<AllocationRecord> {
        let original: AllocationRecord = txn
            .get(cf::ALLOCATIONS, allocation_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("allocation {}", allocation_id)))?;
        if original.kind == AllocationKind::Reversal {
            return Err(Error::InvalidRequest(format!(
                "allocation row {} is itself a reversal",
                allocation_id
            )));
        }

        let marker = reversal_marker(allocation_id);
        if let Some(existing) = txn.lock::<AllocationId>(cf::REVERSALS, &marker)? {
            return Err(Error::AlreadyReversed(format!(
                "allocation {} reversed by {}",
                allocation_id, existing
            )));
        }

        let (lot, head, remaining) = self.lock_lot(txn, original.lot_id)?;
        let after = remaining.checked_add(original.amount)?;
        if after > lot.total_value_received {
            return Err(Error::InvariantViolation(format!(
                "reversal would raise lot {} to {} above its total {}",
                lot.id, after, lot.total_value_received
            )));
        }

        let row = self.stage_row(
            txn,
            &lot,
            head,
            AllocationKind::Reversal,
            original.amount,
            remaining,
            after,
            Some(allocation_id),
            Some(reason.to_string()),
            actor,
            events,
        )?;
        txn.insert(cf::REVERSALS, &marker, &row.id)?;
        Ok(row)
    }

    /// Lock the lot's head and derive its remaining value
    fn lock_lot(&self, txn: &WriteTxn<'_>, lot_id: LotId) -> Result<(InventoryLot, Option<LotHead>, Money)> {
        let lot: InventoryLot = txn
            .get(cf::LOTS, lot_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("lot {}", lot_id)))?;

        let head: Option<LotHead> = txn.lock(cf::LOT_HEADS, lot_id.as_bytes())?;
        let remaining = match head {
            Some(head) => {
                let last: AllocationRecord = txn
                    .get(cf::ALLOCATIONS, head.last_allocation_id.as_bytes())?
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "lot {} head points at missing row {}",
                            lot_id, head.last_allocation_id
                        ))
                    })?;
                last.remaining_after
            }
            None => lot.total_value_received,
        };
        Ok((lot, head, remaining))
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_row(
        &self,
        txn: &WriteTxn<'_>,
        lot: &InventoryLot,
        head: Option<LotHead>,
        kind: AllocationKind,
        amount: Money,
        remaining_before: Money,
        remaining_after: Money,
        reverses: Option<AllocationId>,
        reference: Option<String>,
        actor: ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<AllocationRecord> {
        if remaining_after.is_negative() || remaining_after > lot.total_value_received {
            return Err(Error::InvariantViolation(format!(
                "lot {} remaining {} outside [0, {}]",
                lot.id, remaining_after, lot.total_value_received
            )));
        }

        let sequence = head.map(|h| h.sequence).unwrap_or(0) + 1;
        let row = AllocationRecord {
            id: AllocationId::new(),
            lot_id: lot.id,
            sequence,
            kind,
            amount,
            remaining_before,
            remaining_after,
            reverses,
            reference,
            created_by: actor,
            created_at: Utc::now(),
        };

        txn.insert(cf::ALLOCATIONS, row.id.as_bytes(), &row)?;
        txn.insert(
            cf::LOT_ALLOCATIONS,
            &keys::join(&[lot.id.as_bytes(), &keys::seq(sequence)]),
            &row.id,
        )?;
        txn.put(
            cf::LOT_HEADS,
            lot.id.as_bytes(),
            &LotHead { sequence, last_allocation_id: row.id },
        )?;

        events.push(EngineEvent::AllocationRecorded {
            allocation_id: row.id,
            lot_id: lot.id,
            amount,
            remaining_after,
            is_reversal: kind == AllocationKind::Reversal,
        });
        Ok(row)
    }

    /// Get lot
    pub fn lot(&self, lot_id: LotId) -> Result<InventoryLot> {
        self.storage.require(cf::LOTS, lot_id.as_bytes(), &format!("lot {}", lot_id))
    }

    /// Every lot ever received
    pub fn lots(&self) -> Result<Vec<InventoryLot>> {
        Ok(self
            .storage
            .scan_all::<InventoryLot>(cf::LOTS)?
            .into_iter()
            .map(|(_, lot)| lot)
            .collect())
    }

    /// Get allocation log row
    pub fn allocation(&self, allocation_id: AllocationId) -> Result<AllocationRecord> {
        self.storage.require(
            cf::ALLOCATIONS,
            allocation_id.as_bytes(),
            &format!("allocation {}", allocation_id),
        )
    }

    /// Every log row of a lot in sequence order
    pub fn allocations(&self, lot_id: LotId) -> Result<Vec<AllocationRecord>> {
        self.storage
            .scan_prefix::<AllocationId>(cf::LOT_ALLOCATIONS, lot_id.as_bytes())?
            .into_iter()
            .map(|(_, id)| self.allocation(id))
            .collect()
    }

    /// Remaining value: the newest log row's `remaining_after`
    pub fn remaining(&self, lot_id: LotId) -> Result<Money> {
        let lot = self.lot(lot_id)?;
        let head: Option<LotHead> = self.storage.get(cf::LOT_HEADS, lot_id.as_bytes())?;
        match head {
            Some(head) => Ok(self.allocation(head.last_allocation_id)?.remaining_after),
            None => Ok(lot.total_value_received),
        }
    }

    /// Recompute remaining value by folding the whole log
    pub fn replay_remaining(&self, lot_id: LotId) -> Result<Money> {
        let lot = self.lot(lot_id)?;
        replay(&lot, &self.allocations(lot_id)?)
    }
}

/// Fold a lot's log from its received total, checking every row
pub fn replay(lot: &InventoryLot, rows: &[AllocationRecord]) -> Result<Money> {
    let mut remaining = lot.total_value_received;
    for row in rows {
        if row.remaining_before != remaining {
            return Err(Error::InvariantViolation(format!(
                "lot {} breaks at sequence {}: expected before {}, found {}",
                lot.id, row.sequence, remaining, row.remaining_before
            )));
        }
        remaining = match row.kind {
            AllocationKind::Allocation => remaining.checked_sub(row.amount)?,
            AllocationKind::Reversal => remaining.checked_add(row.amount)?,
        };
        if remaining != row.remaining_after
            || remaining.is_negative()
            || remaining > lot.total_value_received
        {
            return Err(Error::InvariantViolation(format!(
                "lot {} sequence {}: recorded after {}, replayed {}",
                lot.id, row.sequence, row.remaining_after, remaining
            )));
        }
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;
    use std::str::FromStr;

    fn inventory() -> (Inventory, tempfile::TempDir) {
        let (storage, outbox, temp) = open_store();
        (Inventory::new(storage, outbox), temp)
    }

    fn manual_lot(total: i64) -> NewLot {
        NewLot {
            company_id: CompanyId::new(),
            product_id: None,
            provenance: Provenance::Manual { justification: "opening balance".to_string() },
            face_value: Money::from_minor(total),
            extra_allocation_pct: Decimal::ZERO,
            total_value_received: Money::from_minor(total),
            received_by: ActorRef::admin("ops-1"),
        }
    }

    #[test]
    fn test_expected_total_rounding() {
        let pct = Decimal::from_str("12.5").unwrap();
        assert_eq!(expected_total(Money::from_minor(1_000), pct).unwrap(), Money::from_minor(1_125));

        // 333 x 1.015 = 337.995 -> 338
        let pct = Decimal::from_str("1.5").unwrap();
        assert_eq!(expected_total(Money::from_minor(333), pct).unwrap(), Money::from_minor(338));
    }

    #[test]
    fn test_receive_lot_validation() {
        let (inventory, _temp) = inventory();

        let mut lot = manual_lot(1_000);
        lot.extra_allocation_pct = Decimal::from(10);
        lot.total_value_received = Money::from_minor(1_101);
        assert!(inventory.receive_lot(lot.clone()).is_ok());

        lot.total_value_received = Money::from_minor(1_102);
        assert!(matches!(inventory.receive_lot(lot), Err(Error::InvalidRequest(_))));

        let mut unjustified = manual_lot(1_000);
        unjustified.provenance = Provenance::Manual { justification: "  ".to_string() };
        assert!(inventory.receive_lot(unjustified).is_err());

        let mut negative = manual_lot(1_000);
        negative.extra_allocation_pct = Decimal::from(-1);
        assert!(inventory.receive_lot(negative).is_err());
    }

    #[test]
    fn test_allocate_decrements_remaining() {
        let (inventory, _temp) = inventory();
        let lot = inventory.receive_lot(manual_lot(1_000)).unwrap();
        assert_eq!(inventory.remaining(lot.id).unwrap(), Money::from_minor(1_000));

        let row = inventory
            .allocate(lot.id, Money::from_minor(600), None, ActorRef::system())
            .unwrap();
        assert_eq!(row.remaining_before, Money::from_minor(1_000));
        assert_eq!(row.remaining_after, Money::from_minor(400));

        let over = inventory.allocate(lot.id, Money::from_minor(600), None, ActorRef::system());
        assert!(matches!(
            over,
            Err(Error::InsufficientInventory { requested: 600, remaining: 400, .. })
        ));
        assert_eq!(inventory.remaining(lot.id).unwrap(), Money::from_minor(400));
        assert_eq!(inventory.replay_remaining(lot.id).unwrap(), Money::from_minor(400));
    }

    #[test]
    fn test_allocate_exact_remaining_reaches_zero() {
        let (inventory, _temp) = inventory();
        let lot = inventory.receive_lot(manual_lot(500)).unwrap();
        inventory
            .allocate(lot.id, Money::from_minor(500), None, ActorRef::system())
            .unwrap();
        assert_eq!(inventory.remaining(lot.id).unwrap(), Money::ZERO);
        assert!(inventory
            .allocate(lot.id, Money::from_minor(1), None, ActorRef::system())
            .is_err());
    }

    #[test]
    fn test_reverse_allocation_restores_once() {
        let (inventory, _temp) = inventory();
        let lot = inventory.receive_lot(manual_lot(1_000)).unwrap();
        let row = inventory
            .allocate(lot.id, Money::from_minor(300), None, ActorRef::system())
            .unwrap();

        let reversal = inventory
            .reverse_allocation(row.id, "investment cancelled", ActorRef::admin("ops-1"))
            .unwrap();
        assert_eq!(reversal.kind, AllocationKind::Reversal);
        assert_eq!(reversal.remaining_after, Money::from_minor(1_000));
        assert_eq!(inventory.allocation(row.id).unwrap(), row);

        assert!(matches!(
            inventory.reverse_allocation(row.id, "again", ActorRef::admin("ops-1")),
            Err(Error::AlreadyReversed(_))
        ));
        assert!(matches!(
            inventory.reverse_allocation(reversal.id, "undo", ActorRef::admin("ops-1")),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(inventory.allocations(lot.id).unwrap().len(), 2);
        assert_eq!(inventory.replay_remaining(lot.id).unwrap(), Money::from_minor(1_000));
    }

    #[test]
    fn test_unknown_lot() {
        let (inventory, _temp) = inventory();
        assert!(matches!(
            inventory.allocate(LotId::new(), Money::from_minor(1), None, ActorRef::system()),
            Err(Error::NotFound(_))
        ));
    }
}

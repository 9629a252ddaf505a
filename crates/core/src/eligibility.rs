//! Rules deciding whether a worker may receive a box from a given lot.

use thiserror::Error;

use crate::types::{BoxLot, ContractType, Worker, WorkerStatus};

/// Reason a delivery cannot be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryRejection {
    #[error("worker is inactive")]
    WorkerInactive,
    #[error("worker already withdrew their box")]
    AlreadyWithdrawn,
    #[error("worker already has an active delivery")]
    AlreadyHasDelivery,
    #[error("box lot is inactive")]
    BoxInactive,
    #[error("box lot has no stock available")]
    OutOfStock,
    #[error("box lot belongs to branch '{box_branch}' but the worker belongs to '{worker_branch}'")]
    BranchMismatch {
        worker_branch: String,
        box_branch: String,
    },
    #[error("box lot is reserved for {box_contract} contracts but the worker has {worker_contract}")]
    ContractMismatch {
        worker_contract: ContractType,
        box_contract: ContractType,
    },
}

impl DeliveryRejection {
    /// Stable machine readable code, also used as the problem `type`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkerInactive => "worker_inactive",
            Self::AlreadyWithdrawn => "already_withdrawn",
            Self::AlreadyHasDelivery => "already_has_delivery",
            Self::BoxInactive => "box_inactive",
            Self::OutOfStock => "out_of_stock",
            Self::BranchMismatch { .. } => "branch_mismatch",
            Self::ContractMismatch { .. } => "contract_mismatch",
        }
    }
}

/// Checks the worker side of a delivery.
pub fn check_worker(worker: &Worker, has_active_delivery: bool) -> Result<(), DeliveryRejection> {
    if !worker.active {
        return Err(DeliveryRejection::WorkerInactive);
    }
    if worker.status == WorkerStatus::Withdrawn {
        return Err(DeliveryRejection::AlreadyWithdrawn);
    }
    if has_active_delivery {
        return Err(DeliveryRejection::AlreadyHasDelivery);
    }
    Ok(())
}

/// Checks the lot side of a delivery, optionally against the branch the guard is serving.
pub fn check_box(lot: &BoxLot, branch: Option<&str>) -> Result<(), DeliveryRejection> {
    if !lot.active {
        return Err(DeliveryRejection::BoxInactive);
    }
    if let Some(branch) = branch {
        if lot.branch != branch {
            return Err(DeliveryRejection::BranchMismatch {
                worker_branch: branch.to_string(),
                box_branch: lot.branch.clone(),
            });
        }
    }
    if lot.available_quantity <= 0 {
        return Err(DeliveryRejection::OutOfStock);
    }
    Ok(())
}

/// Full eligibility check for handing `lot` to `worker`.
pub fn check_delivery(
    worker: &Worker,
    has_active_delivery: bool,
    lot: &BoxLot,
) -> Result<(), DeliveryRejection> {
    check_worker(worker, has_active_delivery)?;
    if !lot.active {
        return Err(DeliveryRejection::BoxInactive);
    }
    if lot.available_quantity <= 0 {
        return Err(DeliveryRejection::OutOfStock);
    }
    if lot.branch != worker.branch {
        return Err(DeliveryRejection::BranchMismatch {
            worker_branch: worker.branch.clone(),
            box_branch: lot.branch.clone(),
        });
    }
    if lot.contract_type != worker.contract_type {
        return Err(DeliveryRejection::ContractMismatch {
            worker_contract: worker.contract_type,
            box_contract: lot.contract_type,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn worker() -> Worker {
        let now = Utc::now();
        Worker {
            id: 1,
            rut: "11111111-1".into(),
            first_name: "Luis".into(),
            paternal_surname: "Pérez".into(),
            maternal_surname: "Mora".into(),
            position: "Operator".into(),
            contract_type: ContractType::Indefinite,
            period: "2025".into(),
            branch: "casablanca".into(),
            area: Some("logistica_distribucion".into()),
            email: None,
            phone: None,
            status: WorkerStatus::Pending,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn lot() -> BoxLot {
        BoxLot {
            id: 7,
            code: "BOX-CAS-IND".into(),
            contract_type: ContractType::Indefinite,
            branch: "casablanca".into(),
            available_quantity: 3,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_matching_worker_and_lot() {
        assert_eq!(check_delivery(&worker(), false, &lot()), Ok(()));
    }

    #[test]
    fn rejects_in_rule_order() {
        let mut w = worker();
        w.status = WorkerStatus::Withdrawn;
        assert_eq!(
            check_delivery(&w, true, &lot()),
            Err(DeliveryRejection::AlreadyWithdrawn)
        );

        let err = check_delivery(&worker(), true, &lot()).unwrap_err();
        assert_eq!(err.code(), "already_has_delivery");

        let mut empty = lot();
        empty.available_quantity = 0;
        assert_eq!(
            check_delivery(&worker(), false, &empty),
            Err(DeliveryRejection::OutOfStock)
        );

        let mut inactive = lot();
        inactive.active = false;
        inactive.available_quantity = 0;
        assert_eq!(
            check_delivery(&worker(), false, &inactive).unwrap_err().code(),
            "box_inactive"
        );
    }

    #[test]
    fn rejects_branch_and_contract_mismatch() {
        let mut other_branch = lot();
        other_branch.branch = "valparaiso_bif".into();
        let err = check_delivery(&worker(), false, &other_branch).unwrap_err();
        assert_eq!(err.code(), "branch_mismatch");
        assert!(err.to_string().contains("valparaiso_bif"));

        let mut fixed = lot();
        fixed.contract_type = ContractType::FixedTerm;
        let err = check_delivery(&worker(), false, &fixed).unwrap_err();
        assert_eq!(
            err,
            DeliveryRejection::ContractMismatch {
                worker_contract: ContractType::Indefinite,
                box_contract: ContractType::FixedTerm,
            }
        );
    }

    #[test]
    fn box_check_honours_requested_branch() {
        assert_eq!(check_box(&lot(), None), Ok(()));
        assert_eq!(check_box(&lot(), Some("casablanca")), Ok(()));
        assert_eq!(
            check_box(&lot(), Some("valparaiso_bic")).unwrap_err().code(),
            "branch_mismatch"
        );
    }

    #[test]
    fn inactive_worker_is_rejected_first() {
        let mut w = worker();
        w.active = false;
        w.status = WorkerStatus::Withdrawn;
        assert_eq!(check_worker(&w, true), Err(DeliveryRejection::WorkerInactive));
    }
}

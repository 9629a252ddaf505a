//! Campaign validation and withdrawal rules.

use std::collections::HashMap;

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{Campaign, ContractType, DeliveryMode, Worker};

/// Writable campaign fields, validated before they reach storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignDraft {
    pub name: String,
    pub description: Option<String>,
    pub branch: String,
    pub delivery_mode: DeliveryMode,
    pub selected_areas: Vec<String>,
    pub contract_types: Vec<ContractType>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub active: bool,
}

impl From<&Campaign> for CampaignDraft {
    fn from(campaign: &Campaign) -> Self {
        Self {
            name: campaign.name.clone(),
            description: campaign.description.clone(),
            branch: campaign.branch.clone(),
            delivery_mode: campaign.delivery_mode,
            selected_areas: campaign.selected_areas.clone(),
            contract_types: campaign.contract_types.clone(),
            start_date: campaign.start_date,
            end_date: campaign.end_date,
            active: campaign.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CampaignValidationError {
    #[error("campaign name is required")]
    EmptyName,
    #[error("end date must be on or after the start date")]
    InvalidDateRange,
    #[error("select at least one contract type")]
    NoContractTypes,
    #[error("group campaigns must select at least one area")]
    NoAreas,
    #[error("unknown area '{0}'")]
    UnknownArea(String),
}

impl CampaignValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyName => "invalid_name",
            Self::InvalidDateRange => "invalid_date_range",
            Self::NoContractTypes => "missing_contract_types",
            Self::NoAreas => "missing_areas",
            Self::UnknownArea(_) => "unknown_area",
        }
    }
}

impl CampaignDraft {
    /// Validates and normalizes the draft against the area catalog.
    ///
    /// General campaigns always serve every catalog area; duplicate entries are dropped.
    pub fn validate(mut self, catalog_areas: &[String]) -> Result<Self, CampaignValidationError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(CampaignValidationError::EmptyName);
        }
        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        if self.end_date < self.start_date {
            return Err(CampaignValidationError::InvalidDateRange);
        }

        let mut contracts = Vec::with_capacity(self.contract_types.len());
        for contract in self.contract_types {
            if !contracts.contains(&contract) {
                contracts.push(contract);
            }
        }
        if contracts.is_empty() {
            return Err(CampaignValidationError::NoContractTypes);
        }
        self.contract_types = contracts;

        match self.delivery_mode {
            DeliveryMode::General => {
                self.selected_areas = catalog_areas.to_vec();
            }
            DeliveryMode::Group => {
                let mut areas: Vec<String> = Vec::with_capacity(self.selected_areas.len());
                for area in self.selected_areas {
                    let area = area.trim().to_string();
                    if !catalog_areas.contains(&area) {
                        return Err(CampaignValidationError::UnknownArea(area));
                    }
                    if !areas.contains(&area) {
                        areas.push(area);
                    }
                }
                if areas.is_empty() {
                    return Err(CampaignValidationError::NoAreas);
                }
                self.selected_areas = areas;
            }
        }

        Ok(self)
    }
}

/// Why a worker cannot withdraw under a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WithdrawalBlock {
    #[error("the campaign is not current")]
    NotCurrent,
    #[error("the worker does not belong to this campaign's branch")]
    WrongBranch,
    #[error("this campaign is only for {0} contracts")]
    ContractNotListed(String),
    #[error("the worker's area is not enabled for this campaign")]
    AreaNotListed,
}

impl Campaign {
    /// Active and `today` lies within the inclusive date range.
    pub fn is_current(&self, today: NaiveDate) -> bool {
        self.active && self.start_date <= today && today <= self.end_date
    }

    pub fn worker_can_withdraw(
        &self,
        worker: &Worker,
        today: NaiveDate,
    ) -> Result<(), WithdrawalBlock> {
        if !self.is_current(today) {
            return Err(WithdrawalBlock::NotCurrent);
        }
        if worker.branch != self.branch {
            return Err(WithdrawalBlock::WrongBranch);
        }
        if !self.contract_types.contains(&worker.contract_type) {
            return Err(WithdrawalBlock::ContractNotListed(
                self.contract_types_display(),
            ));
        }
        if self.delivery_mode == DeliveryMode::Group {
            let listed = worker
                .area
                .as_ref()
                .is_some_and(|area| self.selected_areas.contains(area));
            if !listed {
                return Err(WithdrawalBlock::AreaNotListed);
            }
        }
        Ok(())
    }

    /// Area names for display, resolved through `names` (code to name).
    pub fn areas_display(&self, names: &HashMap<String, String>) -> String {
        if self.delivery_mode == DeliveryMode::General {
            return "All areas".to_string();
        }
        self.selected_areas
            .iter()
            .map(|code| names.get(code).cloned().unwrap_or_else(|| code.clone()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn contract_types_display(&self) -> String {
        self.contract_types
            .iter()
            .map(|c| c.label())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Percentage of eligible workers served, rounded to two decimals.
pub fn completion_percent(eligible: i64, made: i64) -> f64 {
    if eligible <= 0 {
        return 0.0;
    }
    let raw = made as f64 / eligible as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

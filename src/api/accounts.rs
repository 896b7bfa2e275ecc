//! Account balance endpoint.

use super::{ApiError, AppState};
use crate::error::PayoutError;
use crate::{ledger, projection};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// When true, bypass the projection and aggregate directly from entries.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_code: String,
    pub balance: String,
    pub debit_minus_credit: String,
    pub currency: String,
    pub as_of_sequence: Option<i64>,
}

/// `GET /api/accounts/{code}/balance`
pub async fn get_balance(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let response = state.store.read(|conn| {
        let account = ledger::get_account_by_code(conn, &code)?
            .ok_or_else(|| PayoutError::UnknownAccount(code.clone()))?;

        if query.refresh {
            let (signed, raw) = ledger::balance_from_entries(conn, &account)?;
            let currency = crate::amount::Currency::usd();
            return Ok(BalanceResponse {
                account_code: account.code,
                balance: crate::amount::Amount::from_minor_units(signed, currency.clone())
                    .to_string(),
                debit_minus_credit: crate::amount::Amount::from_minor_units(raw, currency.clone())
                    .to_string(),
                currency: currency.as_str().to_string(),
                as_of_sequence: None,
            });
        }

        match projection::account_balance(conn, &account.code)? {
            Some(row) => Ok(BalanceResponse {
                account_code: account.code,
                currency: row.balance.currency().as_str().to_string(),
                balance: row.balance.to_string(),
                debit_minus_credit: row.debit_minus_credit.to_string(),
                as_of_sequence: Some(row.as_of_sequence),
            }),
            None => {
                // No entries have landed yet.
                let currency = crate::amount::Currency::usd();
                Ok(BalanceResponse {
                    account_code: account.code,
                    balance: crate::amount::Amount::zero(currency.clone()).to_string(),
                    debit_minus_credit: crate::amount::Amount::zero(currency.clone()).to_string(),
                    currency: currency.as_str().to_string(),
                    as_of_sequence: None,
                })
            }
        }
    })?;

    Ok(Json(response))
}

//! Integrator notifications.
//!
//! Payloads are flat JSON objects signed with the product secret: `sign` is
//! the hex HMAC-SHA256 of `k1=v1&k2=v2...` over every other field, keys in
//! ascending order. Rows go to the store's outbox; delivery happens elsewhere.

use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::store::DepositNotifyCommit;
use crate::types::{
    DepositRecord, Notification, NotifyEvent, NotifyItem, Product, ProductId, Withdrawal,
};

type HmacSha256 = Hmac<Sha256>;

pub const ASSET_SYMBOL: &str = "BTC";

/// Render satoshis as a fixed 8-decimal BTC string.
pub fn format_btc(sat: u64) -> String {
    format!("{}.{:08}", sat / 100_000_000, sat % 100_000_000)
}

/// Hex HMAC-SHA256 of the canonical rendering of `fields`.
pub fn sign_fields(fields: &BTreeMap<&str, String>, secret: &str) -> Result<String, CustodyError> {
    let canonical = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CustodyError::Config(format!("product secret: {e}")))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a body produced by [`notification`] against `secret`.
pub fn verify_body(body: &str, secret: &str) -> bool {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body)
    else {
        return false;
    };
    let mut fields = BTreeMap::new();
    let mut claimed = None;
    for (key, value) in &map {
        let Some(value) = value.as_str() else {
            return false;
        };
        if key == "sign" {
            claimed = Some(value.to_string());
        } else {
            fields.insert(key.as_str(), value.to_string());
        }
    }
    match (claimed, sign_fields(&fields, secret)) {
        (Some(claimed), Ok(expected)) => claimed == expected,
        _ => false,
    }
}

/// Build a signed outbox row for `product`.
pub fn notification(
    product: &Product,
    event: NotifyEvent,
    item: NotifyItem,
    tx_hash: &str,
    amount: u64,
    serial: Option<&str>,
    address: &str,
) -> Result<Notification, CustodyError> {
    let mut fields = BTreeMap::new();
    fields.insert("tx_hash", tx_hash.to_string());
    fields.insert("amount", format_btc(amount));
    fields.insert("app_name", product.app_name.clone());
    fields.insert("address", address.to_string());
    fields.insert("symbol", ASSET_SYMBOL.to_string());
    fields.insert("notify_type", event.as_str().to_string());
    if let Some(serial) = serial {
        fields.insert("serial", serial.to_string());
    }
    let sign = sign_fields(&fields, &product.secret)?;

    let mut body = serde_json::Map::new();
    for (key, value) in fields {
        body.insert(key.to_string(), serde_json::Value::String(value));
    }
    body.insert("sign".into(), serde_json::Value::String(sign));

    Ok(Notification {
        id: 0,
        product_id: product.id,
        event,
        item,
        callback_url: product.callback_url.clone(),
        body: serde_json::Value::Object(body).to_string(),
    })
}

pub fn withdrawal_notification(
    product: &Product,
    withdrawal: &Withdrawal,
    event: NotifyEvent,
) -> Result<Notification, CustodyError> {
    notification(
        product,
        event,
        NotifyItem::Withdrawal(withdrawal.id),
        withdrawal.tx_reference.as_deref().unwrap_or_default(),
        withdrawal.amount,
        Some(&withdrawal.serial),
        withdrawal.to_address.as_str(),
    )
}

pub fn deposit_notification(
    product: &Product,
    deposit: &DepositRecord,
) -> Result<Notification, CustodyError> {
    notification(
        product,
        NotifyEvent::DepositConfirmed,
        NotifyItem::Deposit(deposit.id),
        &deposit.tx_hash(),
        deposit.value,
        None,
        deposit.address.as_str(),
    )
}

/// Products by id for the given owners.
pub fn product_map(
    ctx: &CustodyContext,
    ids: impl IntoIterator<Item = ProductId>,
) -> Result<HashMap<ProductId, Product>, CustodyError> {
    let mut ids: Vec<ProductId> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ctx
        .store
        .products(&ids)?
        .into_iter()
        .map(|p| (p.id, p))
        .collect())
}

/// Turns confirmed deposits into `deposit_confirmed` notifications.
pub struct DepositNotifier {
    ctx: CustodyContext,
}

impl DepositNotifier {
    pub fn new(ctx: CustodyContext) -> Self {
        Self { ctx }
    }

    /// Notify every pending deposit in one commit. Returns the number of
    /// notifications written.
    pub fn notify_deposits(&self) -> Result<usize, CustodyError> {
        let deposits = self.ctx.store.pending_deposits()?;
        if deposits.is_empty() {
            debug!("no pending deposits");
            return Ok(0);
        }
        let products = product_map(&self.ctx, deposits.iter().map(|d| d.product_id))?;

        let mut commit = DepositNotifyCommit::default();
        for deposit in &deposits {
            commit.deposits.push(deposit.id);
            match products.get(&deposit.product_id) {
                Some(product) => commit
                    .notifications
                    .push(deposit_notification(product, deposit)?),
                None => warn!(
                    deposit = deposit.id,
                    product = deposit.product_id,
                    "deposit for unknown product, marking notified"
                ),
            }
        }

        let written = commit.notifications.len();
        self.ctx.store.commit_deposit_notifications(commit)?;
        info!(deposits = deposits.len(), notifications = written, "deposits notified");
        Ok(written)
    }
}

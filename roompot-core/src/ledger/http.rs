use super::{
    EscrowCreated, EscrowRoomParams, IdempotencyKey, LedgerError, LedgerGateway, LedgerReceipt,
    RefundTarget, SettlementWinner,
};
use crate::error::{Result, RoomError};
use crate::types::Amount;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Escrow ledger reached over a JSON HTTP API.
///
/// Each operation is a `POST {base_url}/escrow/{op}` carrying the
/// idempotency key as a header. Server errors and transport failures are
/// reported as `Unreachable`, 4xx answers as `Rejected`.
#[derive(Debug, Clone)]
pub struct HttpLedgerGateway {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    params: &'a EscrowRoomParams,
    payment: Amount,
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    ledger_room_id: &'a str,
    payer: &'a str,
    payment: Amount,
}

#[derive(Serialize)]
struct RefundRequest<'a> {
    ledger_room_id: &'a str,
    target: &'a RefundTarget,
}

#[derive(Serialize)]
struct SettleRequest<'a> {
    ledger_room_id: &'a str,
    winners: &'a [SettlementWinner],
}

impl HttpLedgerGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoomError::config(format!("Failed to build ledger client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<B, T>(
        &self,
        path: &str,
        key: &IdempotencyKey,
        body: &B,
    ) -> std::result::Result<T, LedgerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/escrow/{}", self.base_url, path);
        tracing::debug!("POST {} key={}", url, key);

        let resp = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, key.as_str())
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        resp.json::<T>()
            .await
            .map_err(|e| LedgerError::Unreachable(format!("malformed ledger response: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout(err.to_string())
    } else {
        LedgerError::Unreachable(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> LedgerError {
    let msg = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        LedgerError::Timeout(msg)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        LedgerError::Unreachable(msg)
    } else {
        LedgerError::Rejected(msg)
    }
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn escrow_create(
        &self,
        key: &IdempotencyKey,
        params: &EscrowRoomParams,
        payment: Amount,
    ) -> std::result::Result<EscrowCreated, LedgerError> {
        self.post("create", key, &CreateRequest { params, payment }).await
    }

    async fn escrow_join(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        payer: &str,
        payment: Amount,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let body = JoinRequest {
            ledger_room_id,
            payer,
            payment,
        };
        self.post("join", key, &body).await
    }

    async fn escrow_refund(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        target: &RefundTarget,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let body = RefundRequest {
            ledger_room_id,
            target,
        };
        self.post("refund", key, &body).await
    }

    async fn escrow_settle(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        winners: &[SettlementWinner],
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let body = SettleRequest {
            ledger_room_id,
            winners,
        };
        self.post("settle", key, &body).await
    }
}

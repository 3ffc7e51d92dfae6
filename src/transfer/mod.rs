use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_code: String,
    pub status: String,
}

/// External transfer provider - the irreversible side effect of the
/// settlement saga. Implementations must be idempotent on `idempotency_ref`.
#[async_trait]
pub trait TransferProvider: Send + Sync {
    async fn initiate_transfer(
        &self,
        amount: Decimal,
        recipient: &str,
        narrative: &str,
        idempotency_ref: &str,
    ) -> AppResult<TransferReceipt>;

    async fn create_recipient(
        &self,
        name: &str,
        account_number: &str,
        bank_code: &str,
    ) -> AppResult<String>;
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    recipient: &'a str,
    reason: &'a str,
    reference: &'a str,
}

#[derive(Deserialize)]
struct ProviderResponse<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct TransferData {
    transfer_code: String,
    status: String,
}

#[derive(Serialize)]
struct RecipientRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    account_number: &'a str,
    bank_code: &'a str,
}

#[derive(Deserialize)]
struct RecipientData {
    recipient_code: String,
}

/// Paystack-style HTTP transfer provider with a bounded request timeout.
pub struct HttpTransferProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransferProvider {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> AppResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", secret_key))
            .map_err(|e| AppError::Config(format!("invalid transfer API secret: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> AppResult<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "transfer provider returned {} for {}",
                response.status(),
                path
            )));
        }

        let body: ProviderResponse<T> = response.json().await?;
        if !body.status {
            return Err(AppError::ExternalService(body.message));
        }

        body.data
            .ok_or_else(|| AppError::ExternalService("transfer provider returned no data".into()))
    }
}

#[async_trait]
impl TransferProvider for HttpTransferProvider {
    async fn initiate_transfer(
        &self,
        amount: Decimal,
        recipient: &str,
        narrative: &str,
        idempotency_ref: &str,
    ) -> AppResult<TransferReceipt> {
        let data: TransferData = self
            .post(
                "/transfer",
                &TransferRequest {
                    amount,
                    recipient,
                    reason: narrative,
                    reference: idempotency_ref,
                },
            )
            .await?;

        info!(
            reference = idempotency_ref,
            transfer_code = %data.transfer_code,
            "transfer initiated"
        );

        Ok(TransferReceipt {
            transfer_code: data.transfer_code,
            status: data.status,
        })
    }

    async fn create_recipient(
        &self,
        name: &str,
        account_number: &str,
        bank_code: &str,
    ) -> AppResult<String> {
        let data: RecipientData = self
            .post(
                "/transferrecipient",
                &RecipientRequest {
                    kind: "nuban",
                    name,
                    account_number,
                    bank_code,
                },
            )
            .await?;

        Ok(data.recipient_code)
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ApiClient, ApiRequest, ApiResult};

const BASE_PATH: &str = "/produtos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOfMeasure {
    #[serde(rename = "UN")]
    Unit,
    #[serde(rename = "KG")]
    Kilogram,
}

/// A product as served by the inventory API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(rename = "codigoBarras")]
    pub barcode: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "unidadeMedida")]
    pub unit: UnitOfMeasure,
    #[serde(rename = "quantidadeEstoque")]
    pub stock: f64,
    #[serde(rename = "precoVenda")]
    pub price: f64,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub total_elements: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub number: Option<u32>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            content: Vec::new(),
            total_elements: Some(0),
            total_pages: Some(0),
            number: Some(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    pub term: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

impl ProductQuery {
    fn into_request(self) -> ApiRequest {
        let mut request = ApiRequest::get(BASE_PATH);
        if let Some(page) = self.page {
            request = request.query("page", page);
        }
        if let Some(size) = self.size {
            request = request.query("size", size);
        }
        if let Some(term) = self.term.filter(|term| !term.trim().is_empty()) {
            request = request.query("busca", term);
        }
        request
    }
}

/// Whether a search term looks like a scanned barcode (8 to 14 digits).
pub fn is_barcode(term: &str) -> bool {
    (8..=14).contains(&term.len()) && term.bytes().all(|b| b.is_ascii_digit())
}

/// Product lookups. Only the most recent [`search`](Self::search) is kept alive; starting
/// a new one cancels the previous.
#[derive(Clone)]
pub struct ProductService {
    client: ApiClient,
    current: Arc<Mutex<Option<(u64, CancellationToken)>>>,
    next_id: Arc<AtomicU64>,
}

impl ProductService {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            current: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn list(&self, query: ProductQuery) -> ApiResult<Page<Product>> {
        self.client.send_json(query.into_request()).await
    }

    pub async fn get(&self, id: i64) -> ApiResult<Product> {
        self.client
            .send_json(ApiRequest::get(format!("{BASE_PATH}/{id}")))
            .await
    }

    /// Search by name or barcode. A search still running when this is called ends with
    /// [`ApiError::Cancelled`](crate::api::ApiError::Cancelled).
    pub async fn search(&self, term: &str, size: u32) -> ApiResult<Page<Product>> {
        let term = term.trim();
        if term.is_empty() {
            self.cancel_current();
            return Ok(Page::empty());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = self.slot().replace((id, cancel.clone())) {
            debug!("superseding previous product search");
            previous.cancel();
        }

        let request = ProductQuery {
            term: Some(term.to_owned()),
            page: None,
            size: Some(size),
        }
        .into_request();
        let result = self.client.send_json_cancellable(request, &cancel).await;

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            slot.take();
        }
        result
    }

    /// First product matching `term`, the way the checkout screen adds items.
    pub async fn lookup(&self, term: &str) -> ApiResult<Option<Product>> {
        let page = self.search(term, 1).await?;
        Ok(page.content.into_iter().next())
    }

    pub fn cancel_current(&self) {
        if let Some((_, cancel)) = self.slot().take() {
            cancel.cancel();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

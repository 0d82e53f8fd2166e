use crate::{BackendError, CreateOfferRequest, OfferBackend, Result, UpdateOfferRequest};
use async_trait::async_trait;
use offer_models::{Offer, OrderId};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct OfferEnvelope {
    offer: Offer,
}

#[derive(Debug, Deserialize)]
struct OffersEnvelope {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    status: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// HTTP/JSON client for the offer service.
///
/// Endpoints, relative to the base URL:
/// - `POST offers` with `{order_id, master_id, price}` returns `{offer}`
/// - `PATCH offers/{id}` with `{status}` returns `{offer}`
/// - `GET orders/{order_id}/offers` returns `{offers}`
#[derive(Debug, Clone)]
pub struct OfferServiceClient {
    client: Client,
    base_url: Url,
}

impl OfferServiceClient {
    /// `timeout` bounds every call; a call that exceeds it fails with
    /// [`BackendError::Unavailable`].
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref()).map_err(|e| BackendError::Internal {
            message: format!("invalid offer service URL: {e}"),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Internal {
                message: format!("offer service URL cannot be a base: {base_url}"),
            });
        }

        let client = Client::builder().timeout(timeout).build()?;

        tracing::info!("Creating OfferServiceClient with base URL: {}", base_url);

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("offer service error")
                .to_string()
        });

    debug!(status = %status, message = %message, "Offer service returned an error");
    Err(BackendError::from_status(status, message))
}

#[async_trait]
impl OfferBackend for OfferServiceClient {
    async fn create_offer(&self, request: CreateOfferRequest) -> Result<Offer> {
        let response = self
            .client
            .post(self.endpoint(&["offers"]))
            .json(&request)
            .send()
            .await?;

        Ok(decode::<OfferEnvelope>(response).await?.offer)
    }

    async fn update_offer(&self, request: UpdateOfferRequest) -> Result<Offer> {
        let response = self
            .client
            .patch(self.endpoint(&["offers", request.offer_id.as_str()]))
            .json(&StatusBody {
                status: &request.status,
            })
            .send()
            .await?;

        Ok(decode::<OfferEnvelope>(response).await?.offer)
    }

    async fn list_offers_for_order(&self, order_id: &OrderId) -> Result<Vec<Offer>> {
        let response = self
            .client
            .get(self.endpoint(&["orders", order_id.as_str(), "offers"]))
            .send()
            .await?;

        Ok(decode::<OffersEnvelope>(response).await?.offers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, patch, post},
        Json, Router,
    };
    use offer_models::{OfferId, PrincipalId};
    use serde_json::{json, Value};

    fn offer_json(id: &str, order_id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "order_id": order_id,
            "master_id": "m-1",
            "price": 100.0,
            "status": status,
        })
    }

    async fn spawn_mock_service() -> String {
        let app = Router::new()
            .route(
                "/api/offers",
                post(|Json(body): Json<Value>| async move {
                    let order_id = body["order_id"].as_str().unwrap_or_default().to_string();
                    (
                        StatusCode::CREATED,
                        Json(json!({ "offer": offer_json("new", &order_id, "pending") })),
                    )
                }),
            )
            .route(
                "/api/offers/:id",
                patch(
                    |Path(id): Path<String>, Json(body): Json<Value>| async move {
                        if id == "missing" {
                            return (
                                StatusCode::NOT_FOUND,
                                Json(json!({ "message": "offer not found" })),
                            );
                        }
                        let status = body["status"].as_str().unwrap_or_default().to_string();
                        (
                            StatusCode::OK,
                            Json(json!({ "offer": offer_json(&id, "O1", &status) })),
                        )
                    },
                ),
            )
            .route(
                "/api/orders/:order_id/offers",
                get(|Path(order_id): Path<String>| async move {
                    if order_id == "broken" {
                        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({ "offers": [offer_json("a", &order_id, "pending")] })),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}/api/")
    }

    #[test]
    fn test_path_building() {
        let client =
            OfferServiceClient::new("http://localhost:3000/api/", Duration::from_secs(1)).unwrap();

        let url = client.endpoint(&["orders", "O 1", "offers"]);
        assert_eq!(url.as_str(), "http://localhost:3000/api/orders/O%201/offers");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(OfferServiceClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_round_trips_against_service() {
        let base = spawn_mock_service().await;
        let client = OfferServiceClient::new(base, Duration::from_secs(5)).unwrap();

        let created = client
            .create_offer(CreateOfferRequest {
                order_id: OrderId::from("O1"),
                master_id: PrincipalId::from("m-1"),
                price: 100.0,
            })
            .await
            .unwrap();
        assert_eq!(created.id, OfferId::from("new"));
        assert_eq!(created.order_id, OrderId::from("O1"));

        let updated = client
            .update_offer(UpdateOfferRequest {
                offer_id: OfferId::from("X"),
                status: "accepted".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(updated.status, "accepted");

        let offers = client
            .list_offers_for_order(&OrderId::from("O2"))
            .await
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].order_id, OrderId::from("O2"));
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let base = spawn_mock_service().await;
        let client = OfferServiceClient::new(base, Duration::from_secs(5)).unwrap();

        let err = client
            .update_offer(UpdateOfferRequest {
                offer_id: OfferId::from("missing"),
                status: "accepted".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::NotFound {
                message: "offer not found".to_string()
            }
        );

        let err = client
            .list_offers_for_order(&OrderId::from("broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Internal { .. }));
        assert_eq!(err.message(), "Internal Server Error");
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            OfferServiceClient::new(format!("http://{addr}/"), Duration::from_secs(1)).unwrap();
        let err = client
            .list_offers_for_order(&OrderId::from("O1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use world_hub_core::UserId;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: String,
    /// Expiry as seconds since the epoch.
    pub exp: i64,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Claims>;
}

/// Shared-secret tokens, minted by `world-hub token` and checked by the server.
pub struct Hs256Verifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Hs256Verifier {
    pub fn new(secret: String) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(
        &self,
        user: &UserId,
        ttl: chrono::Duration,
    ) -> jsonwebtoken::errors::Result<String> {
        let claims = Claims {
            sub: user.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[async_trait]
impl TokenVerifier for Hs256Verifier {
    async fn verify(&self, token: &str) -> Option<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding, &validation)
            .ok()
            .map(|d| d.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_tokens_verify_with_the_same_secret() {
        let verifier = Hs256Verifier::new("secret".into());
        let token = verifier
            .issue(&UserId::from("p1"), chrono::Duration::hours(1))
            .unwrap();
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.sub, "p1");

        let other = Hs256Verifier::new("other".into());
        assert!(other.verify(&token).await.is_none());
        assert!(verifier.verify("not-a-token").await.is_none());
    }

    #[tokio::test]
    async fn expired_tokens_are_refused() {
        let verifier = Hs256Verifier::new("secret".into());
        let token = verifier
            .issue(&UserId::from("p1"), chrono::Duration::hours(-2))
            .unwrap();
        assert!(verifier.verify(&token).await.is_none());
    }
}

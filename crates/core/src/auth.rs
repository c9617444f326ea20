use crate::models::Principal;
use crate::traits::PrincipalResolver;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct AccessClaims {
    user_id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Resolves HS256 access tokens to a user; anything else is anonymous.
pub struct JwtPrincipalResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtPrincipalResolver {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn principal_for(&self, token: &str) -> Principal {
        let claims = match decode::<AccessClaims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(rejection) => {
                debug!(error = %rejection, "token rejected");
                return Principal::Anonymous;
            }
        };

        if claims
            .token_type
            .as_deref()
            .is_some_and(|kind| kind != "access")
        {
            return Principal::Anonymous;
        }

        Principal::User {
            id: claims.user_id,
            username: claims.username,
        }
    }
}

#[async_trait]
impl PrincipalResolver for JwtPrincipalResolver {
    async fn resolve(&self, token: Option<&str>) -> Principal {
        match token.map(str::trim) {
            Some(token) if !token.is_empty() => self.principal_for(token),
            _ => Principal::Anonymous,
        }
    }
}

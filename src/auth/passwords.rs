//! Salted bcrypt hashing, run off the async executor.

use super::AuthError;

/// Hash a password with the given bcrypt cost.
pub async fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| AuthError::Hashing(err.to_string()))?
        .map_err(|err| AuthError::Hashing(err.to_string()))
}

/// Check a password against a stored hash.
pub async fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| AuthError::Hashing(err.to_string()))?
        .map_err(|err| AuthError::Hashing(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_are_salted_and_verifiable() {
        let first = hash_password("correct horse", 4).await.expect("hash");
        let second = hash_password("correct horse", 4).await.expect("hash");
        assert_ne!(first, second);
        assert!(!first.contains("correct horse"));
        assert!(verify_password("correct horse", &first).await.expect("verify"));
        assert!(!verify_password("wrong", &first).await.expect("verify"));
    }
}

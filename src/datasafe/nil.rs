use async_trait::async_trait;

use super::{DataSafe, DataSafeError};

/// Backend that keeps nothing. Sessions live only as long as the process.
#[derive(Debug, Default)]
pub struct NilDataSafe;

#[async_trait]
impl DataSafe for NilDataSafe {
    async fn save(&self, _key: &str, _data: &str) -> Result<(), DataSafeError> {
        Ok(())
    }

    async fn load(&self, _key: &str) -> Result<String, DataSafeError> {
        Ok(String::new())
    }

    async fn configure(&self, _config: &str) -> Result<(), DataSafeError> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn flush_and_close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nil_forgets_everything() {
        let safe = NilDataSafe;
        safe.configure("whatever").await.unwrap();
        safe.save("doc", "hello").await.unwrap();
        assert_eq!(safe.load("doc").await.unwrap(), "");
        assert!(!safe.is_durable());
        safe.flush_and_close().await;
    }
}

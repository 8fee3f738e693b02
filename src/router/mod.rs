pub mod traefik;

/// A source of hostnames that should resolve to the ingress destination.
#[cfg_attr(test, mockall::automock(type Error = std::io::Error;))]
#[async_trait::async_trait]
pub trait Router: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_routes(&self) -> Result<Vec<Route>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub id: String,
    pub host: String,
}

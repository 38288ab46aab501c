use async_graphql::{Context, EmptySubscription, Object, Schema};

use crate::domain::model::{DaemonHealth, Device, RouteAdvertisement, Snapshot};
use crate::domain::service::StatusService;

pub type TaildashSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn health(&self, ctx: &Context<'_>) -> async_graphql::Result<DaemonHealth> {
        let svc = ctx.data::<StatusService>()?;
        Ok(svc.health().await)
    }

    /// The full cached snapshot, refreshing when stale.
    async fn snapshot(&self, ctx: &Context<'_>) -> async_graphql::Result<Snapshot> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.as_ref().clone())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    async fn self_device(&self, ctx: &Context<'_>) -> async_graphql::Result<Device> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.self_device.clone())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    async fn peers(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Device>> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.peers.values().cloned().collect())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    /// Look up one peer by stable node id. Null for an unknown id.
    async fn peer(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<Device>> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.peers.get(&id).cloned())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    /// Devices currently willing to act as exit nodes (active or pending).
    async fn exit_nodes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Device>> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.exit_nodes().into_iter().cloned().collect())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    /// Subnet routes advertised across the tailnet, with approval state.
    async fn routes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<RouteAdvertisement>> {
        let svc = ctx.data::<StatusService>()?;
        svc.get_snapshot()
            .await
            .map(|s| s.route_summary())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Force a refresh through the single-flight path and return the
    /// resulting snapshot.
    async fn refresh(&self, ctx: &Context<'_>) -> async_graphql::Result<Snapshot> {
        let svc = ctx.data::<StatusService>()?;
        svc.refresh()
            .await
            .map(|s| s.as_ref().clone())
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }

    /// Drop cache freshness; the next read re-collects.
    async fn invalidate(&self, ctx: &Context<'_>) -> async_graphql::Result<bool> {
        let svc = ctx.data::<StatusService>()?;
        svc.invalidate().await;
        Ok(true)
    }
}

pub fn build_schema(service: StatusService) -> TaildashSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(service)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    #[tokio::test]
    async fn schema_builds_and_answers_health() {
        let service = StatusService::new(&DaemonConfig::default()).unwrap();
        let schema = build_schema(service);

        let sdl = schema.sdl();
        assert!(sdl.contains("type Device"));
        assert!(sdl.contains("selfDevice"));
        assert!(sdl.contains("exitNodes"));

        let response = schema.execute("{ health { status version } }").await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
    }
}

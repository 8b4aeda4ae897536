mod mock_platform;
mod reconcile_flow;

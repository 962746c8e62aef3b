//! `GET /users/:id` — a dynamic-segment route with a params schema and a
//! response schema, so a malformed handler return value is caught (and
//! logged) rather than shipped to the client.

use std::sync::Arc;

use garde::Validate;
use portway_core::validation::GardeSchema;
use portway_core::{Context, RouteMethod, RouteSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Validate)]
struct UserParams {
    #[garde(length(min = 1))]
    id: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct UserResponse {
    #[garde(length(min = 1))]
    id: String,
}

pub fn register() {
    portway_core::register_route!("users/[id].rs", GET, || {
        RouteMethod::new(handler).with_schema(RouteSchema {
            params: Some(Arc::new(GardeSchema::<UserParams>::new("UserParams"))),
            response: Some(Arc::new(GardeSchema::<UserResponse>::new("UserResponse"))),
            ..RouteSchema::default()
        })
    });
}

async fn handler(ctx: Context) -> Result<serde_json::Value, portway_core::PortwayError> {
    let id = ctx.params.get("id").cloned().unwrap_or_default();
    Ok(serde_json::to_value(UserResponse { id }).unwrap_or(serde_json::Value::Null))
}

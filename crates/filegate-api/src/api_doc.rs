//! OpenAPI documentation.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Filegate API",
        description = "Stateless file processing gateway. Each capability is a POST endpoint taking a multipart upload and returning the processed file, or a JSON error envelope."
    ),
    paths(
        handlers::index::index,
        handlers::health::health_check,
        handlers::status::service_status,
        handlers::capability::run_capability,
    ),
    components(schemas(
        error::ErrorResponse,
        handlers::index::IndexResponse,
        handlers::index::CapabilityInfo,
        handlers::health::HealthResponse,
        handlers::status::StatusResponse,
        handlers::status::ToolStatus,
        filegate_core::CapabilityGroup,
        filegate_core::InputPolicy,
    )),
    tags(
        (name = "service", description = "Index, health and status"),
        (name = "capabilities", description = "File processing capabilities")
    )
)]
pub struct ApiDoc;

pub fn get_openapi_spec() -> utoipa::openapi::OpenApi {
    let mut spec = ApiDoc::openapi();
    spec.info.version = env!("CARGO_PKG_VERSION").to_string();
    spec
}

//! OpenAPI document for the poll-based REST surface. Generated by
//! `tools/generate-openapi`; gated behind the `openapi` feature so the
//! production binary does not carry `utoipa`'s derive machinery.

use utoipa::OpenApi;

use crate::api::poll;
use crate::broker::{StatusSnapshot, WorkspaceStatus};
use crate::model::DispatchResult;

#[derive(OpenApi)]
#[openapi(
    paths(
        poll::reserve,
        poll::ack,
        poll::progress,
        poll::list_inflight,
        poll::submit,
        poll::status,
    ),
    components(schemas(
        poll::ReserveRequest,
        poll::AckRequest,
        poll::AckResponse,
        poll::ProgressRequest,
        poll::ProgressResponse,
        poll::SubmitRequest,
        poll::SubmitResponse,
        poll::AssignRequest,
        poll::BroadcastResponse,
        DispatchResult,
        StatusSnapshot,
        WorkspaceStatus,
    )),
    tags((name = "adm-broker", description = "Agent dispatch poll surface")),
)]
pub struct ApiDoc;

use axum::{extract::State, response::Json};

use crate::{auth::AuthUser, services::members::MemberResponse, ApiResponse, ApiResult, AppState};

#[utoipa::path(
    get,
    path = "/api/v1/members/me",
    responses(
        (status = 200, description = "The authenticated member", body = ApiResponse<MemberResponse>),
        (status = 401, description = "Not authenticated", body = crate::errors::ErrorResponse),
        (status = 404, description = "Member no longer exists", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "members"
)]
pub async fn me(State(state): State<AppState>, user: AuthUser) -> ApiResult<MemberResponse> {
    let member = state
        .services
        .members
        .find_member_by_id(user.member_id)
        .await?;
    Ok(Json(ApiResponse::success(member.into())))
}

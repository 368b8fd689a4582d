//! Wire types for the minimal upstream surface the service consumes.

use serde::Deserialize;
use vp_domain::snapshot::{
    UpstreamAuthorizationRecord, UpstreamMembershipRecord, UpstreamUserRecord,
};

/// One page of upstream records plus the upstream's total count.
///
/// `consumed` counts the upstream objects this page walked (users, safes,
/// groups) and drives the offset; `items` may be larger when container
/// objects flatten into several records (safe members, group members).
#[derive(Debug, Clone)]
pub struct UpstreamPage<T> {
    pub items: Vec<T>,
    pub consumed: u64,
    pub total: u64,
}

impl<T> UpstreamPage<T> {
    /// Whether another page should be fetched after `fetched_so_far`
    /// upstream objects.
    pub fn has_more(&self, fetched_so_far: u64) -> bool {
        fetched_so_far < self.total && self.consumed > 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    #[serde(rename = "Users", default)]
    pub users: Vec<UserDto>,
    #[serde(rename = "Total", default)]
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserDto {
    pub id: i64,
    pub username: String,
    #[serde(rename = "userType", default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(rename = "personalDetails", default)]
    pub personal_details: Option<PersonalDetails>,
    #[serde(default)]
    pub internet: Option<InternetDetails>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PersonalDetails {
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InternetDetails {
    #[serde(rename = "businessEmail", default)]
    pub business_email: Option<String>,
}

impl From<UserDto> for UpstreamUserRecord {
    fn from(dto: UserDto) -> Self {
        let personal = dto.personal_details.unwrap_or_default();
        Self {
            upstream_id: dto.id.to_string(),
            username: dto.username,
            first_name: personal.first_name,
            last_name: personal.last_name,
            email: dto.internet.and_then(|i| i.business_email),
            user_type: dto.user_type,
            suspended: dto.suspended,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Safes (with members)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SafesResponse {
    #[serde(default)]
    pub value: Vec<SafeDto>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct SafeDto {
    #[serde(rename = "safeName")]
    pub safe_name: String,
    #[serde(default)]
    pub members: Vec<SafeMemberDto>,
}

#[derive(Debug, Deserialize)]
pub struct SafeMemberDto {
    #[serde(rename = "memberName")]
    pub member_name: String,
    #[serde(default)]
    pub permissions: Option<serde_json::Value>,
}

impl SafeDto {
    /// Flatten a safe's member list into authorization records. The
    /// upstream id is `safe:member`, stable across runs.
    pub fn into_authorizations(self) -> Vec<UpstreamAuthorizationRecord> {
        let safe_name = self.safe_name;
        self.members
            .into_iter()
            .map(|m| UpstreamAuthorizationRecord {
                upstream_id: format!("{safe_name}:{}", m.member_name),
                safe_name: safe_name.clone(),
                member_name: m.member_name,
                permissions: m.permissions,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Groups (with members)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct GroupsResponse {
    #[serde(default)]
    pub value: Vec<GroupDto>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct GroupDto {
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(default)]
    pub members: Vec<GroupMemberDto>,
}

#[derive(Debug, Deserialize)]
pub struct GroupMemberDto {
    pub username: String,
    #[serde(rename = "memberType", default)]
    pub member_type: Option<String>,
}

impl GroupDto {
    pub fn into_memberships(self) -> Vec<UpstreamMembershipRecord> {
        let group_name = self.group_name;
        self.members
            .into_iter()
            .map(|m| UpstreamMembershipRecord {
                upstream_id: format!("{group_name}:{}", m.username),
                group_name: group_name.clone(),
                member_username: m.username,
                member_type: m.member_type,
            })
            .collect()
    }
}

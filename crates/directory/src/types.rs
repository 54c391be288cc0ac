use serde::{Deserialize, Serialize};

/// A Cloud Controller space. The default value stands for "no space".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub guid: String,
    pub name: String,
    pub organization_guid: String,
}

/// A Cloud Controller organization. The default value stands for "no organization".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub guid: String,
    pub name: String,
}

/// Wire shape of a single v2 resource.
#[derive(Debug, Deserialize)]
pub(crate) struct Resource<E> {
    pub metadata: Metadata,
    pub entity: E,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Metadata {
    pub guid: String,
}

/// Wire shape of a paginated v2 listing.
#[derive(Debug, Deserialize)]
pub(crate) struct Page<E> {
    pub next_url: Option<String>,
    pub resources: Vec<Resource<E>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SpaceEntity {
    pub name: String,
    pub organization_guid: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrganizationEntity {
    pub name: String,
}

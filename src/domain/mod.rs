// Domain layer: data model and ports for the external collaborators (DHIS2 API, storage, progress).

pub mod model;
pub mod ports;

/// Globally-unique warehouse identifier derived from a URN prefix.
/// Example: `urn:glue2:globusendpoint:globusuuid:a1b2c3d4-0000-4f00-b000-1234567890ab`
pub type GlobalId = String;
/// Identifier native to the source system (the transfer service's UUID).
/// Example: `a1b2c3d4-0000-4f00-b000-1234567890ab`
pub type NativeId = String;
/// Content-type tag carried by an envelope and expected by a step.
/// Examples: `GlobusEndpoint`, `goendpoints`
pub type TypeTag = String;
/// Name of a pipeline step, used in counters, outcomes, and log lines.
/// Example: `urn:glue2:globusendpoint`
pub type StepName = String;
/// Catalog namespace key referenced by a step config.
/// Example: `urn:glue2:globusendpoint`
pub type CatalogUrn = String;
/// Affiliation/namespace scope for stored records.
/// Example: `xsede.org`
pub type Affiliation = String;
/// Relation type label on a derived edge.
/// Example: `gateway_supports`
pub type RelationType = String;
/// Composite key identifying an endpoint in diff reports.
/// Example: `xsede#stampede2gsiftp://gridftp.stampede2.tacc.utexas.edu:2811`
pub type EndpointKey = String;

//! Graph ontology: node and relationship types, the entity-relationship
//! validity matrix, canonical entity names, and decision scopes.
//!
//! The validity matrix constrains which typed relationships may connect two
//! entity types; triples outside the matrix are downgraded to `RELATED_TO`
//! with their confidence scaled by 0.8 rather than dropped.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{OnceLock, RwLock};

/// Types of entities extracted from decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// PostgreSQL, React, Neo4j
    Technology,
    /// microservices, REST API, caching
    Concept,
    /// singleton, repository pattern
    Pattern,
    /// authentication system, payment gateway
    System,
    /// team members, stakeholders
    Person,
    /// companies, teams
    Organization,
    /// source files / modules in the codebase
    File,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technology => "technology",
            Self::Concept => "concept",
            Self::Pattern => "pattern",
            Self::System => "system",
            Self::Person => "person",
            Self::Organization => "organization",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "technology" => Some(Self::Technology),
            "concept" => Some(Self::Concept),
            "pattern" => Some(Self::Pattern),
            "system" => Some(Self::System),
            "person" => Some(Self::Person),
            "organization" => Some(Self::Organization),
            "file" => Some(Self::File),
        _ => None,
        }
    }

    /// Fuzzy-match acceptance threshold for this entity type.
    ///
    /// Files need near-exact matches (a wrong file means a wrong AFFECTS
    /// edge); concepts tolerate looser phrasing.
    pub fn fuzzy_threshold(&self) -> f64 {
        match self {
            Self::File => 0.95,
            Self::Technology => 0.85,
            Self::Concept => 0.75,
            Self::Pattern => 0.78,
            Self::System => 0.88,
            Self::Person => 0.92,
            Self::Organization => 0.90,
        }
    }

    /// Embedding-similarity acceptance threshold for this entity type.
    pub fn embedding_threshold(&self) -> f64 {
        match self {
            Self::File => 0.97,
            Self::Technology => 0.90,
            Self::Concept => 0.82,
            Self::Pattern => 0.85,
            Self::System => 0.92,
            Self::Person => 0.95,
            Self::Organization => 0.93,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed relationships in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    // Entity-entity
    #[serde(rename = "IS_A")]
    IsA,
    #[serde(rename = "PART_OF")]
    PartOf,
    #[serde(rename = "DEPENDS_ON")]
    DependsOn,
    #[serde(rename = "RELATED_TO")]
    RelatedTo,
    #[serde(rename = "ALTERNATIVE_TO")]
    AlternativeTo,
    #[serde(rename = "ENABLES")]
    Enables,
    #[serde(rename = "PREVENTS")]
    Prevents,
    #[serde(rename = "REQUIRES")]
    Requires,
    #[serde(rename = "REFINES")]
    Refines,

    // Decision-entity
    #[serde(rename = "INVOLVES")]
    Involves,

    // Decision-decision
    #[serde(rename = "SIMILAR_TO")]
    SimilarTo,
    #[serde(rename = "INFLUENCED_BY")]
    InfluencedBy,
    #[serde(rename = "SUPERSEDES")]
    Supersedes,
    #[serde(rename = "CONTRADICTS")]
    Contradicts,
    #[serde(rename = "FOLLOWS")]
    Follows,
    #[serde(rename = "PRECEDES")]
    Precedes,

    // Codebase connectivity
    #[serde(rename = "AFFECTS")]
    Affects,
    #[serde(rename = "IMPLEMENTED_BY")]
    ImplementedBy,
    #[serde(rename = "TOUCHES")]
    Touches,
    #[serde(rename = "REJECTED_BY")]
    RejectedBy,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsA => "IS_A",
            Self::PartOf => "PART_OF",
            Self::DependsOn => "DEPENDS_ON",
            Self::RelatedTo => "RELATED_TO",
            Self::AlternativeTo => "ALTERNATIVE_TO",
            Self::Enables => "ENABLES",
            Self::Prevents => "PREVENTS",
            Self::Requires => "REQUIRES",
            Self::Refines => "REFINES",
            Self::Involves => "INVOLVES",
            Self::SimilarTo => "SIMILAR_TO",
            Self::InfluencedBy => "INFLUENCED_BY",
            Self::Supersedes => "SUPERSEDES",
            Self::Contradicts => "CONTRADICTS",
            Self::Follows => "FOLLOWS",
            Self::Precedes => "PRECEDES",
            Self::Affects => "AFFECTS",
            Self::ImplementedBy => "IMPLEMENTED_BY",
            Self::Touches => "TOUCHES",
            Self::RejectedBy => "REJECTED_BY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "IS_A" => Some(Self::IsA),
            "PART_OF" => Some(Self::PartOf),
            "DEPENDS_ON" => Some(Self::DependsOn),
            "RELATED_TO" => Some(Self::RelatedTo),
            "ALTERNATIVE_TO" => Some(Self::AlternativeTo),
            "ENABLES" => Some(Self::Enables),
            "PREVENTS" => Some(Self::Prevents),
            "REQUIRES" => Some(Self::Requires),
            "REFINES" => Some(Self::Refines),
            "INVOLVES" => Some(Self::Involves),
            "SIMILAR_TO" => Some(Self::SimilarTo),
            "INFLUENCED_BY" => Some(Self::InfluencedBy),
            "SUPERSEDES" => Some(Self::Supersedes),
            "CONTRADICTS" => Some(Self::Contradicts),
            "FOLLOWS" => Some(Self::Follows),
            "PRECEDES" => Some(Self::Precedes),
            "AFFECTS" => Some(Self::Affects),
            "IMPLEMENTED_BY" => Some(Self::ImplementedBy),
            "TOUCHES" => Some(Self::Touches),
            "REJECTED_BY" => Some(Self::RejectedBy),
            _ => None,
        }
    }

    /// Relationships valid only between two entities, never decisions.
    pub fn is_entity_only(&self) -> bool {
        matches!(
            self,
            Self::IsA
                | Self::PartOf
                | Self::DependsOn
                | Self::AlternativeTo
                | Self::Enables
                | Self::Prevents
                | Self::Requires
                | Self::Refines
        )
    }

    /// Relationships valid only between two decisions.
    pub fn is_decision_only(&self) -> bool {
        matches!(
            self,
            Self::SimilarTo
                | Self::InfluencedBy
                | Self::Supersedes
                | Self::Contradicts
                | Self::Follows
                | Self::Precedes
        )
    }

    /// Relationships scanned for circular dependencies.
    pub const CYCLE_SENSITIVE: [RelationType; 5] = [
        Self::DependsOn,
        Self::Requires,
        Self::PartOf,
        Self::IsA,
        Self::Refines,
    ];
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical level of a decision; determines the staleness half-life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Strategic,
    Architectural,
    Library,
    Config,
    Operational,
    Unknown,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strategic => "strategic",
            Self::Architectural => "architectural",
            Self::Library => "library",
            Self::Config => "config",
            Self::Operational => "operational",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "strategic" => Self::Strategic,
            "architectural" => Self::Architectural,
            "library" => Self::Library,
            "config" => Self::Config,
            "operational" => Self::Operational,
            _ => Self::Unknown,
        }
    }

    /// Days before a decision of this scope is considered stale.
    pub fn staleness_threshold_days(&self) -> i64 {
        match self {
            Self::Strategic => 730,
            Self::Architectural => 180,
            Self::Library => 90,
            Self::Config => 30,
            Self::Operational => 14,
            Self::Unknown => 90,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type TypePair = (EntityType, EntityType);

fn validity_matrix() -> &'static HashMap<RelationType, HashSet<TypePair>> {
    use EntityType::*;
    use RelationType::*;

    static MATRIX: OnceLock<HashMap<RelationType, HashSet<TypePair>>> = OnceLock::new();
    MATRIX.get_or_init(|| {
        let mut m: HashMap<RelationType, HashSet<TypePair>> = HashMap::new();

        // IS_A: taxonomic. "PostgreSQL IS_A database"
        m.insert(
            IsA,
            HashSet::from([
                (Technology, Concept),
                (Technology, Technology),
                (Pattern, Concept),
                (System, Concept),
                (Concept, Concept),
            ]),
        );
        // PART_OF: composition. "React PART_OF frontend"
        m.insert(
            PartOf,
            HashSet::from([
                (Technology, System),
                (Technology, Technology),
                (Technology, Concept),
                (System, System),
                (Pattern, System),
                (Concept, Concept),
                (Person, Organization),
            ]),
        );
        // DEPENDS_ON: "Next.js DEPENDS_ON React"
        m.insert(
            DependsOn,
            HashSet::from([
                (Technology, Technology),
                (System, Technology),
                (System, System),
                (Pattern, Technology),
                (Pattern, Concept),
            ]),
        );
        // RELATED_TO: general association fallback
        m.insert(
            RelatedTo,
            HashSet::from([
                (Technology, Technology),
                (Technology, Concept),
                (Technology, Pattern),
                (Technology, System),
                (Concept, Concept),
                (Concept, Pattern),
                (Concept, System),
                (Pattern, Pattern),
                (Pattern, System),
                (System, System),
                (Person, Technology),
                (Person, System),
                (Organization, Technology),
                (Organization, System),
            ]),
        );
        // ALTERNATIVE_TO: symmetric substitution. "MongoDB ALTERNATIVE_TO PostgreSQL"
        m.insert(
            AlternativeTo,
            HashSet::from([
                (Technology, Technology),
                (Pattern, Pattern),
                (System, System),
                (Concept, Concept),
            ]),
        );
        // ENABLES: "Docker ENABLES containerization"
        m.insert(
            Enables,
            HashSet::from([
                (Technology, Concept),
                (Technology, Pattern),
                (Technology, System),
                (Pattern, Concept),
                (System, Concept),
                (System, System),
                (Concept, Concept),
            ]),
        );
        // PREVENTS: "Rate limiting PREVENTS abuse"
        m.insert(
            Prevents,
            HashSet::from([
                (Technology, Concept),
                (Pattern, Concept),
                (System, Concept),
                (Concept, Concept),
            ]),
        );
        // REQUIRES: hard dependency, stronger than DEPENDS_ON
        m.insert(
            Requires,
            HashSet::from([
                (Technology, Technology),
                (Technology, Concept),
                (Pattern, Technology),
                (Pattern, Concept),
                (System, Technology),
                (System, Concept),
            ]),
        );
        // REFINES: "FastAPI REFINES Starlette"
        m.insert(
            Refines,
            HashSet::from([
                (Technology, Technology),
                (Pattern, Pattern),
                (Concept, Concept),
                (System, System),
            ]),
        );

        m
    })
}

/// Outcome of validating an entity-entity relationship triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedRelation {
    pub relation: RelationType,
    pub confidence: f64,
    /// True when the triple was outside the matrix and downgraded.
    pub downgraded: bool,
}

/// Validate `(source_type, relation, target_type)` against the matrix.
///
/// Invalid combinations fall back to `RELATED_TO` at `confidence * 0.8`.
pub fn validate_entity_relationship(
    source_type: EntityType,
    relation: RelationType,
    target_type: EntityType,
    confidence: f64,
) -> ValidatedRelation {
    let valid = validity_matrix()
        .get(&relation)
        .is_some_and(|pairs| pairs.contains(&(source_type, target_type)));

    if valid {
        ValidatedRelation {
            relation,
            confidence,
            downgraded: false,
        }
    } else {
        ValidatedRelation {
            relation: RelationType::RelatedTo,
            confidence: confidence * 0.8,
            downgraded: true,
        }
    }
}

/// Static canonical names for common technologies, patterns, and concepts.
///
/// Keys are lowercase aliases; values are the canonical display names. The
/// resolver consults this before fuzzy matching so that "postgres",
/// "postgresql", and "pg" collapse to one entity.
fn canonical_names() -> &'static HashMap<&'static str, &'static str> {
    static NAMES: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    NAMES.get_or_init(|| {
        HashMap::from([
            // Databases
            ("postgres", "PostgreSQL"),
            ("postgresql", "PostgreSQL"),
            ("pg", "PostgreSQL"),
            ("mysql", "MySQL"),
            ("mariadb", "MariaDB"),
            ("mongo", "MongoDB"),
            ("mongodb", "MongoDB"),
            ("sqlite", "SQLite"),
            ("sqlite3", "SQLite"),
            ("redis", "Redis"),
            ("neo4j", "Neo4j"),
            ("dynamo", "DynamoDB"),
            ("dynamodb", "DynamoDB"),
            ("elasticsearch", "Elasticsearch"),
            ("elastic search", "Elasticsearch"),
            ("cassandra", "Apache Cassandra"),
            ("kafka", "Apache Kafka"),
            ("apache kafka", "Apache Kafka"),
            ("rabbitmq", "RabbitMQ"),
            ("rabbit mq", "RabbitMQ"),
            // Languages & runtimes
            ("js", "JavaScript"),
            ("javascript", "JavaScript"),
            ("ts", "TypeScript"),
            ("typescript", "TypeScript"),
            ("py", "Python"),
            ("python", "Python"),
            ("python3", "Python"),
            ("rust", "Rust"),
            ("golang", "Go"),
            ("node", "Node.js"),
            ("nodejs", "Node.js"),
            ("node.js", "Node.js"),
            ("deno", "Deno"),
            ("bun", "Bun"),
            // Frontend
            ("react", "React"),
            ("reactjs", "React"),
            ("react.js", "React"),
            ("vue", "Vue.js"),
            ("vuejs", "Vue.js"),
            ("vue.js", "Vue.js"),
            ("svelte", "Svelte"),
            ("angular", "Angular"),
            ("next", "Next.js"),
            ("nextjs", "Next.js"),
            ("next.js", "Next.js"),
            ("nuxt", "Nuxt"),
            ("tailwind", "Tailwind CSS"),
            ("tailwindcss", "Tailwind CSS"),
            // Backend frameworks
            ("fastapi", "FastAPI"),
            ("flask", "Flask"),
            ("django", "Django"),
            ("express", "Express"),
            ("expressjs", "Express"),
            ("spring", "Spring"),
            ("spring boot", "Spring Boot"),
            ("rails", "Ruby on Rails"),
            ("ruby on rails", "Ruby on Rails"),
            ("axum", "Axum"),
            ("actix", "Actix Web"),
            ("tokio", "Tokio"),
            // Cloud & infra
            ("aws", "AWS"),
            ("amazon web services", "AWS"),
            ("gcp", "Google Cloud"),
            ("google cloud platform", "Google Cloud"),
            ("azure", "Azure"),
            ("k8s", "Kubernetes"),
            ("kubernetes", "Kubernetes"),
            ("docker", "Docker"),
            ("terraform", "Terraform"),
            ("lambda", "AWS Lambda"),
            ("aws lambda", "AWS Lambda"),
            ("s3", "Amazon S3"),
            ("ec2", "Amazon EC2"),
            ("nginx", "NGINX"),
            // APIs & protocols
            ("rest", "REST API"),
            ("rest api", "REST API"),
            ("graphql", "GraphQL"),
            ("grpc", "gRPC"),
            ("websocket", "WebSocket"),
            ("websockets", "WebSocket"),
            ("http2", "HTTP/2"),
            // Auth & security
            ("jwt", "JWT"),
            ("json web token", "JWT"),
            ("json web tokens", "JWT"),
            ("oauth", "OAuth"),
            ("oauth2", "OAuth 2.0"),
            ("oauth 2.0", "OAuth 2.0"),
            ("oidc", "OpenID Connect"),
            ("openid connect", "OpenID Connect"),
            ("saml", "SAML"),
            // Observability
            ("prometheus", "Prometheus"),
            ("grafana", "Grafana"),
            ("datadog", "Datadog"),
            ("sentry", "Sentry"),
            ("opentelemetry", "OpenTelemetry"),
            ("otel", "OpenTelemetry"),
            ("jaeger", "Jaeger"),
            // Patterns & concepts
            ("microservices", "Microservices"),
            ("microservice", "Microservices"),
            ("micro-services", "Microservices"),
            ("monolith", "Monolith"),
            ("monolithic", "Monolith"),
            ("serverless", "Serverless"),
            ("ci/cd", "CI/CD"),
            ("cicd", "CI/CD"),
            ("continuous integration", "CI/CD"),
            ("continuous deployment", "CI/CD"),
            ("event driven", "Event-Driven Architecture"),
            ("event-driven", "Event-Driven Architecture"),
            ("cqrs", "CQRS"),
            ("event sourcing", "Event Sourcing"),
            ("ddd", "Domain-Driven Design"),
            ("domain driven design", "Domain-Driven Design"),
            ("clean architecture", "Clean Architecture"),
            ("hexagonal architecture", "Hexagonal Architecture"),
            ("ports and adapters", "Hexagonal Architecture"),
            ("iac", "Infrastructure as Code"),
            ("infrastructure as code", "Infrastructure as Code"),
            ("orm", "ORM"),
            ("mvc", "MVC"),
            ("repository pattern", "Repository Pattern"),
        ])
    })
}

static DYNAMIC_CANONICAL: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn dynamic_canonical() -> &'static RwLock<HashMap<String, String>> {
    DYNAMIC_CANONICAL.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Canonical name for an entity, or the input unchanged when unknown.
///
/// The static dictionary is consulted first, then the dynamically refreshed
/// set populated from package-registry lookups.
pub fn get_canonical_name(name: &str) -> String {
    let key = name.to_lowercase();
    if let Some(canonical) = canonical_names().get(key.as_str()) {
        return (*canonical).to_string();
    }
    if let Ok(dynamic) = dynamic_canonical().read() {
        if let Some(canonical) = dynamic.get(&key) {
            return canonical.clone();
        }
    }
    name.to_string()
}

/// Whether `name` is one of the canonical display names.
pub fn is_canonical_name(name: &str) -> bool {
    canonical_names().values().any(|v| *v == name)
}

/// Merge registry-derived alias mappings into the dynamic dictionary.
pub fn extend_canonical_names(mappings: HashMap<String, String>) {
    if let Ok(mut dynamic) = dynamic_canonical().write() {
        for (alias, canonical) in mappings {
            dynamic.entry(alias.to_lowercase()).or_insert(canonical);
        }
    }
}

/// Normalize an entity name for comparison (lowercase, trimmed).
pub fn normalize_entity_name(name: &str) -> String {
    name.to_lowercase().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_triple_passes_through() {
        let v = validate_entity_relationship(
            EntityType::Technology,
            RelationType::DependsOn,
            EntityType::Technology,
            0.9,
        );
        assert_eq!(v.relation, RelationType::DependsOn);
        assert!(!v.downgraded);
        assert!((v.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_triple_downgrades_to_related_to() {
        // A person cannot DEPEND_ON a concept.
        let v = validate_entity_relationship(
            EntityType::Person,
            RelationType::DependsOn,
            EntityType::Concept,
            0.9,
        );
        assert_eq!(v.relation, RelationType::RelatedTo);
        assert!(v.downgraded);
        assert!((v.confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_canonical_name_lookup() {
        assert_eq!(get_canonical_name("postgres"), "PostgreSQL");
        assert_eq!(get_canonical_name("PostgreSQL"), "PostgreSQL");
        assert_eq!(get_canonical_name("k8s"), "Kubernetes");
        assert_eq!(get_canonical_name("some-internal-tool"), "some-internal-tool");
    }

    #[test]
    fn test_dynamic_canonical_extension() {
        extend_canonical_names(HashMap::from([(
            "lefthook".to_string(),
            "Lefthook".to_string(),
        )]));
        assert_eq!(get_canonical_name("Lefthook".to_lowercase().as_str()), "Lefthook");
    }

    #[test]
    fn test_scope_half_lives() {
        assert_eq!(Scope::Strategic.staleness_threshold_days(), 730);
        assert_eq!(Scope::Operational.staleness_threshold_days(), 14);
        assert_eq!(Scope::parse("weird").staleness_threshold_days(), 90);
    }

    #[test]
    fn test_relation_roundtrip() {
        for rel in [
            RelationType::IsA,
            RelationType::Supersedes,
            RelationType::RejectedBy,
        ] {
            assert_eq!(RelationType::parse(rel.as_str()), Some(rel));
        }
        assert_eq!(RelationType::parse("NOT_A_RELATION"), None);
    }

    #[test]
    fn test_entity_only_and_decision_only_are_disjoint() {
        for rel in [
            RelationType::IsA,
            RelationType::DependsOn,
            RelationType::SimilarTo,
            RelationType::Involves,
        ] {
            assert!(!(rel.is_entity_only() && rel.is_decision_only()));
        }
    }
}

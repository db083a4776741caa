use crate::config::AppConfig;
use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas usadas:
/// :Note (notas indexadas) y :Query (consultas registradas).
///
/// El id único de :Note es lo que convierte cada escritura en un
/// reemplazo atómico por documento.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Note.id único
        "CREATE CONSTRAINT note_id IF NOT EXISTS
         FOR (n:Note)
         REQUIRE n.id IS UNIQUE",
        // Query.id único
        "CREATE CONSTRAINT query_id IF NOT EXISTS
         FOR (q:Query)
         REQUIRE q.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

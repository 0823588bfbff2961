use anyhow::{Context, Result};

use std::io::{BufReader, Cursor};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use oxigraph::io::{RdfFormat, RdfParser, RdfSerializer};
use oxigraph::model::Graph as OxigraphGraph;
use oxigraph::model::Triple;

use log::debug;

/// Current UTC time as an RFC 3339 string with microsecond precision. Strings
/// in this format sort in chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses `bytes` as RDF in `format` into a graph. Quads in named graphs are
/// folded into the default graph.
pub fn parse_graph(bytes: &[u8], format: RdfFormat, base_iri: Option<&str>) -> Result<OxigraphGraph> {
    let mut parser = RdfParser::from_format(format);
    if let Some(base) = base_iri {
        parser = parser
            .with_base_iri(base)
            .with_context(|| format!("Invalid base IRI {base}"))?;
    }
    let mut graph = OxigraphGraph::new();
    for quad in parser.for_reader(BufReader::new(Cursor::new(bytes))) {
        let quad = quad?;
        let triple = Triple::new(quad.subject, quad.predicate, quad.object);
        graph.insert(&triple);
    }
    debug!("Parsed {} triples as {}", graph.len(), format);
    Ok(graph)
}

/// Serializes a graph as N-Triples.
pub fn graph_to_ntriples(graph: &OxigraphGraph) -> Result<Vec<u8>> {
    let mut serializer = RdfSerializer::from_format(RdfFormat::NTriples).for_writer(Vec::new());
    for triple in graph.iter() {
        serializer.serialize_triple(triple)?;
    }
    Ok(serializer.finish()?)
}

/// Reads an N-Triples file back into a graph.
pub fn read_ntriples_file(file: &Path) -> Result<OxigraphGraph> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    parse_graph(&bytes, RdfFormat::NTriples, None)
}

/// Serde helpers for durations stored as whole milliseconds in config files.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

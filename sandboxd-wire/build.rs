fn main() {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        // Host/source-vm/bridge snapshots get persisted as JSONB alongside
        // their typed columns, so every message round-trips through serde.
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["proto/sandbox.proto"], &["proto"])
        .expect("failed to compile sandbox.proto");
}

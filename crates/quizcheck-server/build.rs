//! Build script for the quizcheck server: generates the `checker` gRPC stubs.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/checker.proto");
    tonic_build::configure().compile_protos(&["proto/checker.proto"], &["proto"])?;
    Ok(())
}

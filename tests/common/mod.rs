//! Shared fixtures: a migrated SQLite file and payload directory inside a
//! temporary directory, and small zip / multipart builders.

#![allow(dead_code)]

use file_gateway::{
    db,
    services::{local_store::LocalObjectStore, store_client::StoreClient},
};
use std::io::{Cursor, Write};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub const BUCKET: &str = "datasets";

/// A migrated local store rooted in a fresh temporary directory.
pub async fn create_test_store() -> (LocalObjectStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_url = format!("sqlite://{}", temp_dir.path().join("meta.db").display());
    let pool = db::connect(&db_url).await.expect("Failed to open database");
    db::migrate(&pool).await.expect("Failed to migrate");

    let store = LocalObjectStore::new(
        std::sync::Arc::new(pool),
        temp_dir.path().join("objects"),
    );
    (store, temp_dir)
}

/// A bucket-bound client over `store` with the test bucket created.
pub async fn client_for<S>(store: S) -> StoreClient
where
    S: file_gateway::services::object_store::ObjectStore + 'static,
{
    let client = StoreClient::new(std::sync::Arc::new(store), BUCKET);
    client.ensure_bucket().await.expect("Failed to create bucket");
    client
}

pub async fn read_object(client: &StoreClient, key: &str) -> Vec<u8> {
    let mut object = client.get(key).await.expect("object should exist");
    let mut buf = Vec::new();
    object
        .reader
        .read_to_end(&mut buf)
        .await
        .expect("Failed to read object");
    buf
}

/// Build an in-memory zip with stored (uncompressed) entries.
pub fn zip_bytes(dirs: &[&str], files: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
    zip_with_method(CompressionMethod::Stored, dirs, files)
}

/// Build an in-memory zip with deflated entries; sizes sit in the local headers.
pub fn deflated_zip_bytes(files: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
    zip_with_method(CompressionMethod::Deflated, &[], files)
}

fn zip_with_method(
    method: CompressionMethod,
    dirs: &[&str],
    files: Vec<(&str, Vec<u8>)>,
) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);
    for dir in dirs {
        writer.add_directory(*dir, options).unwrap();
    }
    for (name, data) in files {
        writer.start_file(name, options).unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Build a zip the way streaming writers do (Java `ZipOutputStream`, `zip -`):
/// every entry is deflated, general purpose flag bit 3 is set, the local
/// header carries zero CRC and sizes, and the real values follow the data in
/// a data descriptor. Payloads are emitted as a single stored deflate block.
pub fn data_descriptor_zip(files: &[(&str, &str)]) -> Vec<u8> {
    const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
    const METHOD_DEFLATED: u16 = 8;
    const DOS_DATE_1980_01_01: u16 = 0x0021;

    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in files {
        let data = data.as_bytes();
        let offset = out.len() as u32;
        let crc = crc32fast::hash(data);
        let len = data.len() as u16;
        let mut deflated = vec![0x01];
        deflated.extend_from_slice(&len.to_le_bytes());
        deflated.extend_from_slice(&(!len).to_le_bytes());
        deflated.extend_from_slice(data);
        let compressed = deflated.len() as u32;
        let uncompressed = data.len() as u32;

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&FLAG_DATA_DESCRIPTOR.to_le_bytes());
        out.extend_from_slice(&METHOD_DEFLATED.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&DOS_DATE_1980_01_01.to_le_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&deflated);
        out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&compressed.to_le_bytes());
        out.extend_from_slice(&uncompressed.to_le_bytes());

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&FLAG_DATA_DESCRIPTOR.to_le_bytes());
        central.extend_from_slice(&METHOD_DEFLATED.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&DOS_DATE_1980_01_01.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&compressed.to_le_bytes());
        central.extend_from_slice(&uncompressed.to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        // extra length, comment length, disk number, internal attributes
        central.extend_from_slice(&[0; 8]);
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }

    let central_offset = out.len() as u32;
    let count = files.len() as u16;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Incompressible payload of `len` bytes.
pub fn noise(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub const BOUNDARY: &str = "----file-gateway-test-boundary";

/// One multipart/form-data part: name, optional file name, payload.
pub struct Part<'a> {
    pub name: &'a str,
    pub file_name: Option<&'a str>,
    pub data: &'a [u8],
}

pub fn text<'a>(name: &'a str, value: &'a str) -> Part<'a> {
    Part {
        name,
        file_name: None,
        data: value.as_bytes(),
    }
}

pub fn file<'a>(name: &'a str, file_name: &'a str, data: &'a [u8]) -> Part<'a> {
    Part {
        name,
        file_name: Some(file_name),
        data,
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    part.name
                )
                .as_bytes(),
            ),
        }
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

//! A sink writing one object in an S3-compatible store.
//!
//! The wire protocol is out of scope: callers supply [`S3Connection`]
//! implementations (an SDK wrapper, a test double, ...) and the crate only
//! relies on this contract. Connections are shared through a blocking
//! borrow/return [`S3ConnectionPool`].

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};

use bytes::BytesMut;

use crate::error::ZarrError;
use crate::sink::Sink;

/// Buffered bytes beyond which an S3 sink switches from a single PUT to a
/// multipart upload, bounding resident memory per object.
pub(crate) const MULTIPART_THRESHOLD: usize = 16 << 20;

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// The endpoint URL.
    pub endpoint: String,
    /// The bucket everything is written to.
    pub bucket_name: String,
    /// An optional region.
    pub region: Option<String>,
}

/// A part uploaded during a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadedPart {
    /// The 1-based part number.
    pub part_number: u32,
    /// The ETag returned by the store.
    pub etag: String,
}

/// The S3 operations the streaming core depends on.
pub trait S3Connection: Send + Sync {
    /// Whether `bucket` exists and is reachable.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the store cannot be reached.
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ZarrError>;

    /// Upload a whole object in one request.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the upload fails.
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), ZarrError>;

    /// Begin a multipart upload, returning its upload id.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the request fails.
    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, ZarrError>;

    /// Upload one part, returning its ETag.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the upload fails.
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, ZarrError>;

    /// Complete a multipart upload from its uploaded parts.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the request fails.
    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ZarrError>;
}

/// A blocking pool of S3 connections.
///
/// Worker jobs borrow a connection for the duration of one operation and
/// return it on drop.
pub struct S3ConnectionPool {
    connections: Mutex<VecDeque<Box<dyn S3Connection>>>,
    available: Condvar,
}

impl S3ConnectionPool {
    /// Create a pool over caller-provided connections.
    #[must_use]
    pub fn new(connections: Vec<Box<dyn S3Connection>>) -> Self {
        assert!(!connections.is_empty(), "connection pool must not be empty");
        Self {
            connections: Mutex::new(connections.into()),
            available: Condvar::new(),
        }
    }

    /// Borrow a connection, blocking until one is available.
    pub fn get_connection(&self) -> PooledConnection<'_> {
        let mut connections = self.connections.lock().unwrap();
        loop {
            if let Some(connection) = connections.pop_front() {
                return PooledConnection {
                    pool: self,
                    connection: Some(connection),
                };
            }
            connections = self.available.wait(connections).unwrap();
        }
    }

    fn return_connection(&self, connection: Box<dyn S3Connection>) {
        self.connections.lock().unwrap().push_back(connection);
        self.available.notify_one();
    }
}

/// A borrowed connection, returned to its pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a S3ConnectionPool,
    connection: Option<Box<dyn S3Connection>>,
}

impl Deref for PooledConnection<'_> {
    type Target = dyn S3Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_deref().unwrap()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.return_connection(connection);
        }
    }
}

/// Create an S3 sink for `key`, verifying the bucket exists first.
///
/// # Errors
/// Returns [`ZarrError::IOError`] if the bucket is missing or unreachable, or
/// [`ZarrError::InvalidArgument`] if `key` is empty.
pub fn make_s3_sink(
    bucket: &str,
    key: &str,
    pool: Arc<S3ConnectionPool>,
) -> Result<S3Sink, ZarrError> {
    if key.is_empty() {
        return Err(ZarrError::InvalidArgument(
            "S3 object key must not be empty".to_string(),
        ));
    }
    let exists = pool.get_connection().bucket_exists(bucket)?;
    if !exists {
        return Err(ZarrError::IOError(format!(
            "bucket '{bucket}' does not exist"
        )));
    }
    Ok(S3Sink::new(bucket, key, pool))
}

/// A sink accumulating one S3 object.
///
/// Bytes buffer in memory and upload on [`flush`](Sink::flush) as a single
/// PUT, unless the buffer crosses [`MULTIPART_THRESHOLD`] first, in which case
/// the sink streams parts of a multipart upload and completes it on flush.
/// Writes must append: each offset must equal the number of bytes received so
/// far.
pub struct S3Sink {
    bucket: String,
    key: String,
    pool: Arc<S3ConnectionPool>,
    buf: BytesMut,
    bytes_received: u64,
    upload_id: Option<String>,
    parts: Vec<UploadedPart>,
}

impl S3Sink {
    fn new(bucket: &str, key: &str, pool: Arc<S3ConnectionPool>) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            pool,
            buf: BytesMut::new(),
            bytes_received: 0,
            upload_id: None,
            parts: Vec::new(),
        }
    }

    fn upload_buffered_part(&mut self) -> Result<(), ZarrError> {
        let connection = self.pool.get_connection();
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = connection.create_multipart_upload(&self.bucket, &self.key)?;
                self.upload_id = Some(id.clone());
                id
            }
        };

        let part_number = self.parts.len() as u32 + 1;
        let data = self.buf.split().freeze();
        let etag =
            connection.upload_part(&self.bucket, &self.key, &upload_id, part_number, &data)?;
        self.parts.push(UploadedPart { part_number, etag });
        Ok(())
    }
}

impl Sink for S3Sink {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), ZarrError> {
        if offset != self.bytes_received {
            return Err(ZarrError::InternalError(format!(
                "non-sequential write to S3 object '{}': offset {offset}, expected {}",
                self.key, self.bytes_received
            )));
        }
        self.buf.extend_from_slice(data);
        self.bytes_received += data.len() as u64;

        if self.buf.len() >= MULTIPART_THRESHOLD {
            self.upload_buffered_part()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ZarrError> {
        if self.upload_id.is_none() {
            let data = self.buf.split().freeze();
            return self
                .pool
                .get_connection()
                .put_object(&self.bucket, &self.key, &data);
        }

        if !self.buf.is_empty() {
            self.upload_buffered_part()?;
        }
        let upload_id = self.upload_id.take().unwrap();
        self.pool.get_connection().complete_multipart_upload(
            &self.bucket,
            &self.key,
            &upload_id,
            &self.parts,
        )?;
        self.parts.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// An in-memory S3 double.
    #[derive(Default)]
    struct FakeS3 {
        objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        staged: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
    }

    impl S3Connection for FakeS3 {
        fn bucket_exists(&self, bucket: &str) -> Result<bool, ZarrError> {
            Ok(bucket == "bucket")
        }

        fn put_object(&self, _bucket: &str, key: &str, data: &[u8]) -> Result<(), ZarrError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        fn create_multipart_upload(&self, _bucket: &str, key: &str) -> Result<String, ZarrError> {
            self.staged
                .lock()
                .unwrap()
                .insert(key.to_string(), Vec::new());
            Ok(format!("upload-{key}"))
        }

        fn upload_part(
            &self,
            _bucket: &str,
            key: &str,
            _upload_id: &str,
            part_number: u32,
            data: &[u8],
        ) -> Result<String, ZarrError> {
            self.staged
                .lock()
                .unwrap()
                .get_mut(key)
                .unwrap()
                .push(data.to_vec());
            Ok(format!("etag-{part_number}"))
        }

        fn complete_multipart_upload(
            &self,
            _bucket: &str,
            key: &str,
            _upload_id: &str,
            parts: &[UploadedPart],
        ) -> Result<(), ZarrError> {
            let staged = self.staged.lock().unwrap().remove(key).unwrap();
            assert_eq!(staged.len(), parts.len());
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), staged.concat());
            Ok(())
        }
    }

    fn fake_pool() -> (Arc<S3ConnectionPool>, Arc<Mutex<HashMap<String, Vec<u8>>>>) {
        let fake = FakeS3::default();
        let objects = Arc::clone(&fake.objects);
        (
            Arc::new(S3ConnectionPool::new(vec![Box::new(fake)])),
            objects,
        )
    }

    #[test]
    fn small_object_is_a_single_put() {
        let (pool, objects) = fake_pool();
        let mut sink = make_s3_sink("bucket", "path/to/obj", pool).unwrap();
        sink.write(0, &[1, 2, 3]).unwrap();
        sink.write(3, &[4, 5]).unwrap();
        sink.flush().unwrap();
        assert_eq!(
            objects.lock().unwrap().get("path/to/obj").unwrap(),
            &[1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn large_object_goes_multipart() {
        let (pool, objects) = fake_pool();
        let mut sink = make_s3_sink("bucket", "big", pool).unwrap();
        let block = vec![7u8; MULTIPART_THRESHOLD];
        sink.write(0, &block).unwrap();
        sink.write(block.len() as u64, &[8, 9]).unwrap();
        sink.flush().unwrap();
        let objects = objects.lock().unwrap();
        let stored = objects.get("big").unwrap();
        assert_eq!(stored.len(), MULTIPART_THRESHOLD + 2);
        assert_eq!(&stored[MULTIPART_THRESHOLD..], &[8, 9]);
    }

    #[test]
    fn rejects_non_sequential_offsets() {
        let (pool, _) = fake_pool();
        let mut sink = make_s3_sink("bucket", "obj", pool).unwrap();
        sink.write(0, &[1]).unwrap();
        assert!(sink.write(5, &[2]).is_err());
    }

    #[test]
    fn missing_bucket_is_an_error() {
        let (pool, _) = fake_pool();
        assert!(make_s3_sink("nope", "obj", pool).is_err());
    }
}

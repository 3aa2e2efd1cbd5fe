//! FastDFS Operations
//!
//! This module implements all client-side file operations (upload, download,
//! delete, metadata, appender updates) plus the tracker listing queries.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::connection::ConnectionPool;
use crate::errors::{FastDFSError, Result};
use crate::protocol::*;
use crate::types::*;

/// Handles all FastDFS file operations
///
/// This struct is used internally by the Client.
pub struct Operations {
    tracker_pool: Arc<ConnectionPool>,
    storage_pool: Arc<ConnectionPool>,
    network_timeout: u64,
    retry_count: usize,
}

impl Operations {
    /// Creates a new Operations handler
    pub fn new(
        tracker_pool: Arc<ConnectionPool>,
        storage_pool: Arc<ConnectionPool>,
        network_timeout: u64,
        retry_count: usize,
    ) -> Self {
        Self {
            tracker_pool,
            storage_pool,
            network_timeout,
            retry_count,
        }
    }

    /// One request/response exchange against a tracker
    async fn tracker_request(&self, cmd: u8, body: &[u8]) -> Result<Bytes> {
        let mut conn = self.tracker_pool.get(None).await?;
        let result = conn.request(cmd, body, self.network_timeout).await;
        if result.is_ok() {
            self.tracker_pool.put(conn).await;
        }
        result
    }

    /// One request/response exchange against a storage server
    async fn storage_request(&self, addr: &str, cmd: u8, body: &[u8]) -> Result<Bytes> {
        self.storage_pool.add_addr(addr.to_string()).await;
        let mut conn = self.storage_pool.get(Some(addr)).await?;
        let result = conn.request(cmd, body, self.network_timeout).await;
        if result.is_ok() {
            self.storage_pool.put(conn).await;
        }
        result
    }

    /// Runs an attempt up to retry_count times with linear backoff,
    /// surfacing non-retryable errors immediately
    async fn with_retries<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.retry_count.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt == attempts - 1 {
                        return Err(e);
                    }
                    last_err = Some(e);
                    sleep(Duration::from_secs((attempt + 1) as u64)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            FastDFSError::InvalidArgument("operation failed after retries".to_string())
        }))
    }

    /// Asks a tracker for a write destination
    async fn get_store_server(&self, group_name: &str) -> Result<(String, StorageEndpoint)> {
        let (cmd, body) = if group_name.is_empty() {
            (
                TrackerCommand::ServiceQueryStoreWithoutGroupOne as u8,
                Bytes::new(),
            )
        } else {
            (
                TrackerCommand::ServiceQueryStoreWithGroupOne as u8,
                pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN),
            )
        };

        let resp = self.tracker_request(cmd, &body).await?;
        if resp.len() != QUERY_STORE_BODY_LEN {
            return Err(FastDFSError::InvalidResponse(format!(
                "store query reply length {} != {}",
                resp.len(),
                QUERY_STORE_BODY_LEN
            )));
        }

        let group = unpad_string(&resp[..FDFS_GROUP_NAME_MAX_LEN]);
        let mut offset = FDFS_GROUP_NAME_MAX_LEN;
        let ip_addr = unpad_string(&resp[offset..offset + IP_ADDRESS_SIZE]);
        offset += IP_ADDRESS_SIZE;
        let port = decode_int64(&resp[offset..offset + 8]) as u16;
        let store_path_index = resp[offset + 8];

        Ok((
            group,
            StorageEndpoint {
                ip_addr,
                port,
                store_path_index,
            },
        ))
    }

    /// Asks a tracker which storage serves an existing file
    async fn get_fetch_server(
        &self,
        cmd: TrackerCommand,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<(StorageEndpoint, Vec<String>)> {
        let mut body = BytesMut::new();
        body.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());

        let resp = self.tracker_request(cmd as u8, &body).await?;
        if resp.len() < QUERY_FETCH_BODY_LEN
            || (resp.len() - QUERY_FETCH_BODY_LEN) % IP_ADDRESS_SIZE != 0
        {
            return Err(FastDFSError::InvalidResponse(format!(
                "fetch query reply length {} invalid",
                resp.len()
            )));
        }

        let mut offset = FDFS_GROUP_NAME_MAX_LEN;
        let ip_addr = unpad_string(&resp[offset..offset + IP_ADDRESS_SIZE]);
        offset += IP_ADDRESS_SIZE;
        let port = decode_int64(&resp[offset..offset + 8]) as u16;
        offset += 8;

        let mut extra = Vec::new();
        while offset < resp.len() {
            extra.push(unpad_string(&resp[offset..offset + IP_ADDRESS_SIZE]));
            offset += IP_ADDRESS_SIZE;
        }

        Ok((
            StorageEndpoint {
                ip_addr,
                port,
                store_path_index: 0,
            },
            extra,
        ))
    }

    /// Uploads a file from the local filesystem
    pub async fn upload_file(
        &self,
        local_filename: &str,
        metadata: Option<&Metadata>,
        is_appender: bool,
    ) -> Result<String> {
        let file_data = read_file_content(local_filename)?;
        let ext_name = get_file_ext_name(local_filename);
        self.upload_buffer(&file_data, &ext_name, metadata, is_appender)
            .await
    }

    /// Uploads data from a buffer
    pub async fn upload_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
        is_appender: bool,
    ) -> Result<String> {
        let file_id = self
            .with_retries(|| self.upload_buffer_once(data, file_ext_name, is_appender))
            .await?;

        if let Some(meta) = metadata {
            if !meta.is_empty() {
                self.set_metadata(&file_id, meta, MetadataFlag::Overwrite)
                    .await?;
            }
        }
        Ok(file_id)
    }

    async fn upload_buffer_once(
        &self,
        data: &[u8],
        file_ext_name: &str,
        is_appender: bool,
    ) -> Result<String> {
        let (_, endpoint) = self.get_store_server("").await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        let cmd = if is_appender {
            StorageCommand::UploadAppenderFile as u8
        } else {
            StorageCommand::UploadFile as u8
        };

        // `path_index(1) | file_size(8) | ext(6) | data`
        let mut body =
            BytesMut::with_capacity(1 + 8 + FDFS_FILE_EXT_NAME_MAX_LEN + data.len());
        body.put_u8(endpoint.store_path_index);
        body.put_u64(data.len() as u64);
        body.put(pad_string(file_ext_name, FDFS_FILE_EXT_NAME_MAX_LEN));
        body.put_slice(data);

        let resp = self.storage_request(&addr, cmd, &body).await?;
        parse_upload_reply(&resp)
    }

    /// Uploads a slave file attached to an existing master file
    pub async fn upload_slave_buffer(
        &self,
        master_file_id: &str,
        prefix: &str,
        data: &[u8],
        file_ext_name: &str,
    ) -> Result<String> {
        let (group_name, master_filename) = split_file_id(master_file_id)?;
        if prefix.is_empty() || prefix.len() > FDFS_FILE_PREFIX_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "bad slave prefix: {:?}",
                prefix
            )));
        }

        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                &group_name,
                &master_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        // `master_len(8) | file_size(8) | prefix(16) | ext(6) | master | data`
        let mut body = BytesMut::new();
        body.put_u64(master_filename.len() as u64);
        body.put_u64(data.len() as u64);
        body.put(pad_string(prefix, FDFS_FILE_PREFIX_MAX_LEN));
        body.put(pad_string(file_ext_name, FDFS_FILE_EXT_NAME_MAX_LEN));
        body.put_slice(master_filename.as_bytes());
        body.put_slice(data);

        let resp = self
            .storage_request(&addr, StorageCommand::UploadSlaveFile as u8, &body)
            .await?;
        parse_upload_reply(&resp)
    }

    /// Downloads a file (length 0 means "to the end")
    pub async fn download_file(&self, file_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        self.with_retries(|| self.download_once(&group_name, &remote_filename, offset, length))
            .await
    }

    async fn download_once(
        &self,
        group_name: &str,
        remote_filename: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryFetchOne,
                group_name,
                remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        // `offset(8) | length(8) | group(16) | filename`
        let mut body = BytesMut::new();
        body.put_u64(offset);
        body.put_u64(length);
        body.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());

        self.storage_request(&addr, StorageCommand::DownloadFile as u8, &body)
            .await
    }

    /// Downloads a file and saves it to the local filesystem
    pub async fn download_to_file(&self, file_id: &str, local_filename: &str) -> Result<()> {
        let data = self.download_file(file_id, 0, 0).await?;
        write_file_content(local_filename, &data)?;
        Ok(())
    }

    /// Deletes a file
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        self.with_retries(|| self.delete_once(&group_name, &remote_filename))
            .await
    }

    async fn delete_once(&self, group_name: &str, remote_filename: &str) -> Result<()> {
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                group_name,
                remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        let mut body = BytesMut::new();
        body.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());

        self.storage_request(&addr, StorageCommand::DeleteFile as u8, &body)
            .await?;
        Ok(())
    }

    /// Sets metadata for a file
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        let metadata_bytes = encode_metadata(metadata);
        // `fn_len(8) | meta_len(8) | flag(1) | group(16) | filename | meta`
        let mut body = BytesMut::new();
        body.put_u64(remote_filename.len() as u64);
        body.put_u64(metadata_bytes.len() as u64);
        body.put_u8(flag as u8);
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());
        body.put(metadata_bytes);

        self.storage_request(&addr, StorageCommand::SetMetadata as u8, &body)
            .await?;
        Ok(())
    }

    /// Retrieves metadata for a file
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryFetchOne,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        let mut body = BytesMut::new();
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());

        let resp = self
            .storage_request(&addr, StorageCommand::GetMetadata as u8, &body)
            .await?;
        decode_metadata(&resp)
    }

    /// Retrieves file information
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryFetchOne,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        let mut body = BytesMut::new();
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN));
        body.put_slice(remote_filename.as_bytes());

        let resp = self
            .storage_request(&addr, StorageCommand::QueryFileInfo as u8, &body)
            .await?;
        if resp.len() < 8 + 8 + 4 + IP_ADDRESS_SIZE {
            return Err(FastDFSError::InvalidResponse(
                "File info response too short".to_string(),
            ));
        }

        let file_size = decode_int64(&resp[0..8]);
        let create_timestamp = decode_int64(&resp[8..16]);
        let crc32 = decode_int32(&resp[16..20]);
        let source_ip = unpad_string(&resp[20..20 + IP_ADDRESS_SIZE]);

        Ok(FileInfo {
            file_size,
            create_time: std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(create_timestamp),
            crc32,
            source_ip_addr: source_ip,
        })
    }

    /// Appends data to an appender file
    pub async fn append_file(&self, file_id: &str, data: &[u8]) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        // `fn_len(8) | size(8) | filename | data`
        let mut body = BytesMut::new();
        body.put_u64(remote_filename.len() as u64);
        body.put_u64(data.len() as u64);
        body.put_slice(remote_filename.as_bytes());
        body.put_slice(data);

        self.storage_request(&addr, StorageCommand::AppendFile as u8, &body)
            .await?;
        Ok(())
    }

    /// Overwrites a range of an appender file
    pub async fn modify_file(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        // `fn_len(8) | offset(8) | size(8) | filename | data`
        let mut body = BytesMut::new();
        body.put_u64(remote_filename.len() as u64);
        body.put_u64(offset);
        body.put_u64(data.len() as u64);
        body.put_slice(remote_filename.as_bytes());
        body.put_slice(data);

        self.storage_request(&addr, StorageCommand::ModifyFile as u8, &body)
            .await?;
        Ok(())
    }

    /// Truncates an appender file
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (endpoint, _) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryUpdate,
                &group_name,
                &remote_filename,
            )
            .await?;
        let addr = format!("{}:{}", endpoint.ip_addr, endpoint.port);

        // `fn_len(8) | new_size(8) | filename`
        let mut body = BytesMut::new();
        body.put_u64(remote_filename.len() as u64);
        body.put_u64(new_size);
        body.put_slice(remote_filename.as_bytes());

        self.storage_request(&addr, StorageCommand::TruncateFile as u8, &body)
            .await?;
        Ok(())
    }

    /// Every ACTIVE storage endpoint serving a file's group
    pub async fn fetch_all_storages(&self, file_id: &str) -> Result<Vec<StorageEndpoint>> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let (first, extra) = self
            .get_fetch_server(
                TrackerCommand::ServiceQueryFetchAll,
                &group_name,
                &remote_filename,
            )
            .await?;

        let port = first.port;
        let mut endpoints = vec![first];
        endpoints.extend(extra.into_iter().map(|ip_addr| StorageEndpoint {
            ip_addr,
            port,
            store_path_index: 0,
        }));
        Ok(endpoints)
    }

    /// Lists every group known to the tracker
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        let resp = self
            .tracker_request(TrackerCommand::ServerListAllGroups as u8, &[])
            .await?;
        decode_group_stats(&resp)
    }

    /// Lists the storage servers of one group
    pub async fn list_storages(&self, group_name: &str) -> Result<Vec<StorageStatEntry>> {
        let body = pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN);
        let resp = self
            .tracker_request(TrackerCommand::ServerListStorage as u8, &body)
            .await?;
        decode_storage_stat_entries(&resp)
    }
}

/// Parses a `group(16) | remote_filename` upload reply into a file id
fn parse_upload_reply(resp: &[u8]) -> Result<String> {
    if resp.len() <= FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidResponse(
            "upload reply too short".to_string(),
        ));
    }
    let group_name = unpad_string(&resp[..FDFS_GROUP_NAME_MAX_LEN]);
    let remote_filename =
        String::from_utf8_lossy(&resp[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
    Ok(join_file_id(&group_name, &remote_filename))
}

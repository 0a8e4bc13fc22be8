//! In-memory doubles for driving the pipelines in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::fs::sha256_file;
use crate::prompt::Prompter;
use crate::store::{BlobStore, HeadInfo, ObjectInfo, RetrievalTier, StorageClass};
use crate::{Result, StashError};

/// Failure injected into the next call of an operation.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Looks like a dropped connection; retried.
    Reset,
    /// Permission problem; never retried.
    Denied,
    /// A retrieval request raced with another one.
    AlreadyRestoring,
}

impl Fault {
    fn error(self) -> StashError {
        match self {
            Fault::Reset => StashError::Network("connection reset by peer".into()),
            Fault::Denied => StashError::Authentication("Access Denied".into()),
            Fault::AlreadyRestoring => {
                StashError::RestoreAlreadyInProgress("object restore already in progress".into())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MockObject {
    data: Vec<u8>,
    class: StorageClass,
    restore: Option<String>,
}

#[derive(Default)]
pub struct MockStore {
    objects: Mutex<BTreeMap<(String, String), MockObject>>,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    restore_script: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8], class: StorageClass) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            MockObject {
                data: data.to_vec(),
                class,
                restore: None,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn class_of(&self, bucket: &str, key: &str) -> Option<StorageClass> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.class)
    }

    /// Queue a failure for the next call of `op` ("head", "put", "get", "restore", "list").
    pub fn fail_next(&self, op: &'static str, fault: Fault) {
        self.faults.lock().unwrap().entry(op).or_default().push_back(fault);
    }

    /// Restore headers successive `head` calls on `key` will report.
    /// An empty entry keeps whatever state the object already has.
    pub fn script_restore(&self, key: &str, headers: &[&str]) {
        self.restore_script
            .lock()
            .unwrap()
            .insert(key.to_string(), headers.iter().map(|h| h.to_string()).collect());
    }

    /// Every call so far, as `"<op> <key>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn enter(&self, op: &'static str, key: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{} {}", op, key));
        match self.faults.lock().unwrap().get_mut(op).and_then(|q| q.pop_front()) {
            Some(fault) => Err(fault.error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for MockStore {
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        class: StorageClass,
        sha256: &str,
    ) -> Result<()> {
        self.enter("put", key)?;
        if sha256_file(source)? != sha256 {
            return Err(StashError::Format(format!("checksum mismatch for {}", key)));
        }
        let data = fs::read(source)?;
        self.insert(bucket, key, &data, class);
        Ok(())
    }

    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        self.enter("get", key)?;
        let object = self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StashError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let readable = !object.class.is_archival()
            || object
                .restore
                .as_deref()
                .is_some_and(|r| r.contains("ongoing-request=\"false\""));
        if !readable {
            return Err(StashError::Validation(format!(
                "InvalidObjectState: {} is archived",
                key
            )));
        }

        fs::write(dest, &object.data)?;
        Ok(object.data.len() as u64)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadInfo>> {
        self.enter("head", key)?;
        let scripted = self
            .restore_script
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|q| q.pop_front());

        let mut objects = self.objects.lock().unwrap();
        let Some(object) = objects.get_mut(&(bucket.to_string(), key.to_string())) else {
            return Ok(None);
        };
        if let Some(header) = scripted.filter(|h| !h.is_empty()) {
            object.restore = Some(header);
        }
        Ok(Some(HeadInfo {
            size: object.data.len() as u64,
            storage_class: object.class,
            restore: object.restore.clone(),
        }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.enter("delete", key)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        _tier: RetrievalTier,
        _days: u32,
    ) -> Result<()> {
        self.enter("restore", key)?;
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StashError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        if object.restore.is_some() {
            return Err(StashError::RestoreAlreadyInProgress(key.to_string()));
        }
        object.restore = Some("ongoing-request=\"true\"".to_string());
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.enter("list", prefix)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, key), object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                storage_class: object.class,
            })
            .collect())
    }
}

/// Answers prompts from fixed scripts and records every question.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirmations: Mutex<VecDeque<bool>>,
    passwords: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(confirmations: &[bool], passwords: &[&str]) -> Self {
        Self {
            confirmations: Mutex::new(confirmations.iter().copied().collect()),
            passwords: Mutex::new(passwords.iter().map(|p| p.to_string()).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        self.asked.lock().unwrap().push(question.to_string());
        Ok(self.confirmations.lock().unwrap().pop_front().unwrap_or(default))
    }

    fn password(&self, prompt: &str) -> Result<Zeroizing<String>> {
        self.asked.lock().unwrap().push(prompt.to_string());
        self.passwords
            .lock()
            .unwrap()
            .pop_front()
            .map(Zeroizing::new)
            .ok_or_else(|| StashError::Validation("no scripted password left".into()))
    }
}

use std::collections::BTreeMap;

/// 调用元数据：透传给对端的有序键值对。
///
/// 键保持调用方给定的大小写原样写入线上头部；查询时大小写不敏感。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入键值；若已存在（忽略大小写）则覆盖并沿用新键名。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let existing = self
            .entries
            .keys()
            .find(|k| k.eq_ignore_ascii_case(&key))
            .cloned();
        if let Some(existing) = existing {
            self.entries.remove(&existing);
        }
        self.entries.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let existing = self
            .entries
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .cloned()?;
        self.entries.remove(&existing)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

use crate::error::RulesError;
use crate::rules::RuleTables;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// 规则表共享句柄
///
/// 读取方拿到的是某一版本的完整快照; 热更新只替换指针,
/// 正在计算的阶段继续使用旧快照, 不会看到部分更新.
#[derive(Debug)]
pub struct RuleStore {
    current: RwLock<Arc<RuleTables>>,
}

impl RuleStore {
    pub fn new(tables: RuleTables) -> Self {
        Self {
            current: RwLock::new(Arc::new(tables)),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<RuleTables> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 原子替换, 返回旧版本
    pub fn swap(&self, tables: RuleTables) -> Arc<RuleTables> {
        let next = Arc::new(tables);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = std::mem::replace(&mut *guard, next);
        tracing::info!(
            from = %previous.version,
            to = %guard.version,
            "Rule tables swapped"
        );
        previous
    }

    /// 从文件重新加载; 加载或校验失败时保持原表不变
    pub fn reload_from(&self, path: &Path) -> Result<Arc<RuleTables>, RulesError> {
        let tables = RuleTables::load(path).map_err(|e| {
            tracing::error!("规则表加载失败 {}: {}", path.display(), e);
            e
        })?;
        self.swap(tables);
        Ok(self.snapshot())
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(RuleTables::builtin())
    }
}

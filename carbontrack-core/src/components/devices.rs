//! Отслеживаемые процессы и видимые GPU.

use std::collections::HashMap;
use sysinfo::System;

/// PID текущего процесса и всех его потомков.
pub fn tracked_pids() -> Vec<u32> {
    let current = std::process::id();
    let mut system = System::new();
    system.refresh_processes();

    let relations: Vec<(u32, Option<u32>)> = system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())))
        .collect();
    descendants(current, &relations)
}

/// Корень и его потомки (рекурсивно) по парам `(pid, parent)`.
pub fn descendants(root: u32, relations: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, parent) in relations {
        if let Some(parent) = parent {
            if parent != pid {
                children.entry(parent).or_default().push(pid);
            }
        }
    }

    let mut result = vec![root];
    let mut idx = 0;
    while idx < result.len() {
        if let Some(kids) = children.get(&result[idx]) {
            for &kid in kids {
                if !result.contains(&kid) {
                    result.push(kid);
                }
            }
        }
        idx += 1;
    }
    result
}

/// Индексы GPU из значения `CUDA_VISIBLE_DEVICES`.
///
/// `None`, если переменная не задана или пуста (видны все устройства).
/// Разбор останавливается на первом нечисловом элементе, как это делает CUDA.
pub fn parse_cuda_visible_devices(value: Option<&str>) -> Option<Vec<u32>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    Some(
        value
            .split(',')
            .map_while(|part| part.trim().parse::<u32>().ok())
            .collect(),
    )
}

/// Индексы GPU из окружения процесса.
pub fn cuda_visible_devices() -> Option<Vec<u32>> {
    let value = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    parse_cuda_visible_devices(value.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_recursive_children() {
        let relations = vec![
            (1, None),
            (10, Some(1)),
            (11, Some(10)),
            (12, Some(11)),
            (20, Some(1)),
            (30, Some(99)),
        ];
        let mut pids = descendants(10, &relations);
        pids.sort_unstable();
        assert_eq!(pids, vec![10, 11, 12]);
    }

    #[test]
    fn ignores_self_parented_entries() {
        let relations = vec![(5, Some(5)), (6, Some(5))];
        assert_eq!(descendants(5, &relations), vec![5, 6]);
    }

    #[test]
    fn current_process_is_tracked() {
        assert!(tracked_pids().contains(&std::process::id()));
    }

    #[test]
    fn parses_cuda_visible_devices() {
        assert_eq!(parse_cuda_visible_devices(None), None);
        assert_eq!(parse_cuda_visible_devices(Some("  ")), None);
        assert_eq!(parse_cuda_visible_devices(Some("0,2")), Some(vec![0, 2]));
        assert_eq!(parse_cuda_visible_devices(Some("1, 3,x,4")), Some(vec![1, 3]));
        assert_eq!(parse_cuda_visible_devices(Some("-1")), Some(vec![]));
    }
}

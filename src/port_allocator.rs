/// ローカルポート割り当て管理
///
/// 開始値から1ずつ増やして払い出す。一度払い出したポートは再利用しない。
/// 65535 を超えたら以降は何も払い出さない（エラーにはしない）。
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: Option<u16>,
}

impl PortAllocator {
    /// 新しいポートアロケーターを作成
    pub fn new(base: u16) -> Self {
        Self { next: Some(base) }
    }

    /// 次のポートを割り当て。上限に達していれば None
    pub fn allocate(&mut self) -> Option<u16> {
        let port = self.next?;
        self.next = port.checked_add(1);
        Some(port)
    }

    /// 残りの割り当て可能数
    pub fn remaining(&self) -> usize {
        self.next
            .map_or(0, |next| usize::from(u16::MAX - next) + 1)
    }

    /// 割り当てが尽きたか
    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }
}

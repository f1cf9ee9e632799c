use super::*;

#[test]
fn lends_up_to_the_preallocated_count_then_refuses() {
    let pool = CachingAllocator::new(2, 1024);
    assert_eq!(pool.capacity(), 2);
    assert_eq!(pool.available(), 2);

    let a = pool.try_get().unwrap();
    let b = pool.try_get().unwrap();
    assert_eq!(pool.available(), 0);
    assert!(pool.try_get().is_none());

    drop(a);
    assert_eq!(pool.available(), 1);
    drop(b);
    assert_eq!(pool.available(), 2);
}

#[test]
fn lent_buffer_is_writable_and_sized_as_configured() {
    let pool = CachingAllocator::new(1, 64);
    let mut buf = pool.try_get().unwrap();
    assert_eq!(buf.size(), 64);
    assert_eq!(buf.len(), 64);
    buf[0] = 0xAB;
    assert_eq!(buf[0], 0xAB);
}

#[test]
fn returning_a_buffer_makes_it_available_to_a_later_borrower() {
    let pool = CachingAllocator::new(1, 16);
    {
        let mut buf = pool.try_get().unwrap();
        buf[0] = 7;
    }
    let buf2 = pool.try_get().unwrap();
    // Freshly preallocated regions are zeroed; a returned buffer keeps
    // whatever the previous borrower left in it since the pool never
    // clears on return (spec §4.6.4 says nothing about zeroing on
    // reuse — that's the borrowing stage's responsibility).
    assert_eq!(buf2[0], 7);
}
